use anyhow::Result;
use clap::Parser;

use crate::cli::SubCommandExtend;
use crate::config::{AVAILABLE_MODELS, Opts};

#[derive(Parser, Debug, Clone)]
pub struct ModelsCommand {}

impl SubCommandExtend for ModelsCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        for model in AVAILABLE_MODELS {
            println!("{}\t{}\t{}", model.key, model.identity(), model.notes);
        }
        Ok(())
    }
}
