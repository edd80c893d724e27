mod clean;
mod index;
mod models;
mod search;

pub use clean::*;
pub use index::*;
pub use models::*;
pub use search::*;

use crossbeam_channel::select;
use log::warn;

use crate::config::Opts;
use crate::engine::{EngineEvent, EngineHandle, Reply};
use crate::error::{Error, Result};
use crate::utils::progress_bar;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// 等待请求完成，同时用进度条显示引擎事件
fn wait_with_progress<T>(handle: &EngineHandle, reply: Reply<T>) -> Result<T> {
    let pb = progress_bar();
    loop {
        select! {
            recv(handle.events()) -> event => match event {
                Ok(EngineEvent::Progress { done, total, message }) => {
                    pb.set_length(total as u64);
                    pb.set_position(done as u64);
                    pb.set_message(message);
                }
                Ok(EngineEvent::Finished(message)) => pb.set_message(message),
                Ok(EngineEvent::Error(message)) => warn!("{message}"),
                Err(_) => {
                    pb.finish_and_clear();
                    return reply.receiver().recv().unwrap_or(Err(Error::EngineStopped));
                }
            },
            recv(reply.receiver()) -> result => {
                pb.finish_and_clear();
                return result.unwrap_or(Err(Error::EngineStopped));
            }
        }
    }
}
