use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, error, info, warn};

use crate::config::{DEFAULT_BATCH_SIZE, ModelIdentity};
use crate::embed::{Embedder, ModelLoader, decode_image};
use crate::error::{Error, Result};
use crate::indexer::{IndexOutcome, Indexer};
use crate::metrics;
use crate::search::IndexSnapshot;

/// 引擎发给界面的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Progress { done: usize, total: usize, message: String },
    Finished(String),
    Error(String),
}

/// 搜索条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// 文本描述
    Text(String),
    /// 图片路径，已索引的图片直接使用缓存的向量，否则现场计算
    Image(PathBuf),
}

/// 一次索引请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Completed { images: usize },
    Cancelled,
}

struct LoadedModel {
    identity: ModelIdentity,
    embedder: Box<dyn Embedder>,
}

/// 同步的引擎，持有模型与当前索引
///
/// 所有操作都会通过事件通道报告进度和结果，调用方也可以直接使用返回值。
/// 需要在后台运行时使用 [`EngineHandle`]。
pub struct Engine {
    loader: Box<dyn ModelLoader>,
    model: Option<LoadedModel>,
    snapshot: Option<Arc<IndexSnapshot>>,
    batch_size: usize,
    cancel: Arc<AtomicBool>,
    indexing: Arc<AtomicBool>,
    events: Sender<EngineEvent>,
}

impl Engine {
    pub fn new(loader: Box<dyn ModelLoader>, events: Sender<EngineEvent>) -> Self {
        Self {
            loader,
            model: None,
            snapshot: None,
            batch_size: DEFAULT_BATCH_SIZE,
            cancel: Arc::new(AtomicBool::new(false)),
            indexing: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn model(&self) -> Option<&ModelIdentity> {
        self.model.as_ref().map(|m| &m.identity)
    }

    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.snapshot.clone()
    }

    pub fn is_indexing(&self) -> bool {
        self.indexing.load(Ordering::Acquire)
    }

    /// 请求取消正在进行的索引，在下一个批次开始前生效，空闲时不做任何事
    pub fn cancel_indexing(&self) {
        if self.is_indexing() {
            self.cancel.store(true, Ordering::Release);
        }
    }

    /// 加载模型
    ///
    /// 与当前模型相同时不做任何事；加载失败时保留原来的模型。
    /// 切换模型后原索引失效，需要重新索引。
    pub fn load_model(&mut self, identity: &ModelIdentity) -> Result<()> {
        if self.model().is_some_and(|m| m == identity) {
            self.emit(EngineEvent::Finished(format!("模型 {identity} 已加载")));
            return Ok(());
        }

        self.emit(EngineEvent::Progress {
            done: 0,
            total: 1,
            message: format!("正在加载模型 {identity}"),
        });
        let start = Instant::now();
        let embedder = match self.loader.load(identity) {
            Ok(embedder) => embedder,
            Err(e) => return Err(self.fail(e)),
        };
        info!("加载模型 {identity} 耗时 {:.2}s", start.elapsed().as_secs_f32());

        self.model = Some(LoadedModel { identity: identity.clone(), embedder });
        if self.snapshot.take().is_some() {
            debug!("模型已切换，丢弃旧索引");
        }
        self.emit(EngineEvent::Finished(format!("模型 {identity} 加载完成")));
        Ok(())
    }

    /// 索引目录，成功后替换当前索引
    ///
    /// 取消或失败时当前索引保持不变
    pub fn index_directory(&mut self, directory: impl AsRef<Path>) -> Result<IndexStatus> {
        // 之前的取消请求只针对之前的索引
        self.cancel.store(false, Ordering::Release);
        self.index_submitted(directory.as_ref())
    }

    /// 保留提交之后收到的取消请求
    fn index_submitted(&mut self, directory: &Path) -> Result<IndexStatus> {
        self.indexing.store(true, Ordering::Release);
        let result = self.run_indexer(directory);
        self.cancel.store(false, Ordering::Release);
        self.indexing.store(false, Ordering::Release);

        match result {
            Ok(IndexOutcome::Completed(snapshot)) => {
                let images = snapshot.len();
                self.snapshot = Some(Arc::new(snapshot));
                self.emit(EngineEvent::Finished(format!("索引完成，共 {images} 张图片")));
                Ok(IndexStatus::Completed { images })
            }
            Ok(IndexOutcome::Cancelled) => {
                self.emit(EngineEvent::Finished("索引已取消".to_string()));
                Ok(IndexStatus::Cancelled)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn run_indexer(&mut self, directory: &Path) -> Result<IndexOutcome> {
        let LoadedModel { identity, embedder } =
            self.model.as_mut().ok_or(Error::NoModelLoaded)?;
        let cancel = &self.cancel;
        let events = &self.events;
        Indexer::new(identity, &mut **embedder)
            .batch_size(self.batch_size)
            .cancel_when(|| cancel.load(Ordering::Acquire))
            .on_progress(|p| {
                let _ = events.send(EngineEvent::Progress {
                    done: p.done,
                    total: p.total,
                    message: p.message,
                });
            })
            .run(directory)
    }

    /// 搜索当前索引，返回按分数降序排列的 (分数, 路径)
    pub fn search(&mut self, query: &Query, top_k: usize) -> Result<Vec<(f32, String)>> {
        let start = Instant::now();
        let (mode, result) = match query {
            Query::Text(text) => ("text", self.search_text(text, top_k)),
            Query::Image(path) => self.search_image(path, top_k),
        };
        match result {
            Ok(result) => {
                let max_score = result.first().map(|(score, _)| *score);
                metrics::observe_search(mode, start.elapsed().as_secs_f32(), max_score);
                debug!("{mode} 搜索耗时 {:.2}ms", start.elapsed().as_secs_f32() * 1000.);
                Ok(result)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn search_text(&mut self, text: &str, top_k: usize) -> Result<Vec<(f32, String)>> {
        let snapshot = self.ready_snapshot(top_k)?;
        let model = self.model.as_mut().ok_or(Error::NoModelLoaded)?;
        let vector = model.embedder.embed_text(text)?;
        snapshot.search(vector.view(), top_k)
    }

    /// 返回搜索方式和结果，方式用于区分指标
    fn search_image(
        &mut self,
        path: &Path,
        top_k: usize,
    ) -> (&'static str, Result<Vec<(f32, String)>>) {
        let snapshot = match self.ready_snapshot(top_k) {
            Ok(snapshot) => snapshot,
            Err(e) => return ("image", Err(e)),
        };

        // 索引中保存的是规范化后的绝对路径
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let key = key.to_string_lossy();
        if snapshot.position(&key).is_some() {
            return ("image", snapshot.search_by_path(&key, top_k));
        }
        if !path.is_file() {
            return ("image", Err(Error::QueryNotIndexed(path.display().to_string())));
        }

        debug!("查询图片不在索引中，现场计算向量: {}", path.display());
        ("file", self.embed_file(path).and_then(|v| snapshot.search(v.view(), top_k)))
    }

    fn embed_file(&mut self, path: &Path) -> Result<ndarray::Array1<f32>> {
        let model = self.model.as_mut().ok_or(Error::NoModelLoaded)?;
        let image = decode_image(path)?;
        let vectors = model.embedder.embed_images(std::slice::from_ref(&image))?;
        if vectors.nrows() != 1 {
            return Err(Error::Model(format!("模型返回了 {} 个向量，期望 1 个", vectors.nrows())));
        }
        Ok(vectors.row(0).to_owned())
    }

    /// 搜索前的公共检查
    fn ready_snapshot(&self, top_k: usize) -> Result<Arc<IndexSnapshot>> {
        if self.is_indexing() {
            return Err(Error::IndexingInProgress);
        }
        if self.model.is_none() {
            return Err(Error::NoModelLoaded);
        }
        let snapshot = self.snapshot.clone().ok_or(Error::NoIndexAvailable)?;
        if top_k == 0 {
            return Err(Error::InvalidTopK);
        }
        Ok(snapshot)
    }

    fn emit(&self, event: EngineEvent) {
        // 没有人监听时直接丢弃
        let _ = self.events.send(event);
    }

    fn fail(&self, err: Error) -> Error {
        error!("{err}");
        self.emit(EngineEvent::Error(err.to_string()));
        err
    }
}

enum Command {
    LoadModel(ModelIdentity, Sender<Result<()>>),
    Index(PathBuf, Sender<Result<IndexStatus>>),
    Search(Query, usize, Sender<Result<Vec<(f32, String)>>>),
}

/// 尚未完成的请求
pub struct Reply<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Reply<T> {
    fn failed(err: Error) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(Err(err));
        Self { rx }
    }

    /// 阻塞等待结果
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(Error::EngineStopped))
    }

    /// 用于 `select!` 同时等待结果和事件
    pub fn receiver(&self) -> &Receiver<Result<T>> {
        &self.rx
    }
}

/// 在后台线程运行的引擎
///
/// 请求按顺序执行，索引期间的搜索请求会立即以 [`Error::IndexingInProgress`] 失败。
/// 取消索引不经过请求队列，可以在任意线程调用。
pub struct EngineHandle {
    commands: Option<Sender<Command>>,
    events: Receiver<EngineEvent>,
    cancel: Arc<AtomicBool>,
    indexing: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn spawn(loader: impl ModelLoader + 'static, batch_size: usize) -> Result<Self> {
        let (event_tx, event_rx) = unbounded();
        let (command_tx, command_rx) = unbounded();
        let engine = Engine::new(Box::new(loader), event_tx).batch_size(batch_size);
        let cancel = engine.cancel.clone();
        let indexing = engine.indexing.clone();

        let worker = thread::Builder::new()
            .name("clip-engine".to_string())
            .spawn(move || worker_loop(engine, command_rx))
            .map_err(|e| Error::io("clip-engine", e))?;

        Ok(Self {
            commands: Some(command_tx),
            events: event_rx,
            cancel,
            indexing,
            worker: Some(worker),
        })
    }

    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.events
    }

    pub fn is_indexing(&self) -> bool {
        self.indexing.load(Ordering::Acquire)
    }

    pub fn cancel_indexing(&self) {
        if self.is_indexing() {
            info!("请求取消索引");
            self.cancel.store(true, Ordering::Release);
        }
    }

    pub fn load_model(&self, identity: ModelIdentity) -> Reply<()> {
        self.submit(|tx| Command::LoadModel(identity, tx)).unwrap_or_else(Reply::failed)
    }

    pub fn index_directory(&self, directory: impl Into<PathBuf>) -> Reply<IndexStatus> {
        // 提交时就标记为索引中，之后的搜索请求不会排在索引后面
        self.cancel.store(false, Ordering::Release);
        self.indexing.store(true, Ordering::Release);
        let directory = directory.into();
        self.submit(|tx| Command::Index(directory, tx)).unwrap_or_else(|e| {
            self.indexing.store(false, Ordering::Release);
            Reply::failed(e)
        })
    }

    pub fn search(&self, query: Query, top_k: usize) -> Reply<Vec<(f32, String)>> {
        if self.is_indexing() {
            warn!("正在索引，拒绝搜索请求");
            return Reply::failed(Error::IndexingInProgress);
        }
        self.submit(|tx| Command::Search(query, top_k, tx)).unwrap_or_else(Reply::failed)
    }

    fn submit<T>(&self, command: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<Reply<T>> {
        let (tx, rx) = bounded(1);
        match &self.commands {
            Some(commands) if commands.send(command(tx)).is_ok() => Ok(Reply { rx }),
            _ => Err(Error::EngineStopped),
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        // 关闭请求通道后后台线程会退出
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("引擎线程异常退出");
            }
        }
    }
}

fn worker_loop(mut engine: Engine, commands: Receiver<Command>) {
    debug!("引擎线程启动");
    for command in commands {
        match command {
            Command::LoadModel(identity, reply) => {
                let _ = reply.send(engine.load_model(&identity));
            }
            Command::Index(directory, reply) => {
                let _ = reply.send(engine.index_submitted(&directory));
            }
            Command::Search(query, top_k, reply) => {
                let _ = reply.send(engine.search(&query, top_k));
            }
        }
    }
    debug!("引擎线程退出");
}

#[cfg(test)]
mod tests {
    use image::DynamicImage;
    use ndarray::prelude::*;

    use super::*;

    struct Constant;

    impl Embedder for Constant {
        fn dimension(&self) -> usize {
            2
        }

        fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Array2<f32>> {
            Ok(Array2::ones((images.len(), 2)))
        }

        fn embed_text(&mut self, _text: &str) -> Result<Array1<f32>> {
            Ok(array![1.0, 0.0])
        }
    }

    struct ConstantLoader;

    impl ModelLoader for ConstantLoader {
        fn load(&self, model: &ModelIdentity) -> Result<Box<dyn Embedder>> {
            match model.model_name.as_str() {
                "constant" => Ok(Box::new(Constant)),
                _ => Err(Error::UnknownModel(model.to_string())),
            }
        }
    }

    fn engine() -> (Engine, Receiver<EngineEvent>) {
        let (tx, rx) = unbounded();
        (Engine::new(Box::new(ConstantLoader), tx), rx)
    }

    #[test]
    fn search_before_index_fails() {
        let (mut engine, events) = engine();
        let query = Query::Text("cat".to_string());
        assert!(matches!(engine.search(&query, 5), Err(Error::NoModelLoaded)));

        engine.load_model(&ModelIdentity::new("constant", "v1")).unwrap();
        assert!(matches!(engine.search(&query, 5), Err(Error::NoIndexAvailable)));
        let errors = events.try_iter().filter(|e| matches!(e, EngineEvent::Error(_))).count();
        assert_eq!(errors, 2);
    }

    #[test]
    fn load_same_model_twice_is_noop() {
        let (mut engine, events) = engine();
        let identity = ModelIdentity::new("constant", "v1");
        engine.load_model(&identity).unwrap();
        events.try_iter().for_each(drop);

        engine.load_model(&identity).unwrap();
        let events = events.try_iter().collect::<Vec<_>>();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], EngineEvent::Finished(msg) if msg.contains("已加载")));
    }

    #[test]
    fn failed_load_keeps_previous_model() {
        let (mut engine, _events) = engine();
        let identity = ModelIdentity::new("constant", "v1");
        engine.load_model(&identity).unwrap();

        let result = engine.load_model(&ModelIdentity::new("missing", "v1"));
        assert!(matches!(result, Err(Error::UnknownModel(_))));
        assert_eq!(engine.model(), Some(&identity));
    }

    #[test]
    fn index_without_model_fails() {
        let (mut engine, _events) = engine();
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(engine.index_directory(dir.path()), Err(Error::NoModelLoaded)));
        assert!(!engine.is_indexing());
    }

    #[test]
    fn idle_cancel_does_not_cancel_next_run() {
        let (mut engine, _events) = engine();
        engine.load_model(&ModelIdentity::new("constant", "v1")).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        image::RgbImage::new(4, 4).save(dir.path().join("a.png")).unwrap();

        engine.cancel_indexing();
        let status = engine.index_directory(dir.path()).unwrap();
        assert_eq!(status, IndexStatus::Completed { images: 1 });
        assert!(!engine.is_indexing());
    }

    /// 计算向量时直接崩溃，后台线程随之退出
    struct Crashing;

    impl Embedder for Crashing {
        fn dimension(&self) -> usize {
            2
        }

        fn embed_images(&mut self, _images: &[DynamicImage]) -> Result<Array2<f32>> {
            panic!("model crashed")
        }

        fn embed_text(&mut self, _text: &str) -> Result<Array1<f32>> {
            panic!("model crashed")
        }
    }

    struct CrashingLoader;

    impl ModelLoader for CrashingLoader {
        fn load(&self, _model: &ModelIdentity) -> Result<Box<dyn Embedder>> {
            Ok(Box::new(Crashing))
        }
    }

    #[test]
    fn stopped_worker_does_not_stay_indexing() {
        let dir = tempfile::TempDir::new().unwrap();
        image::RgbImage::new(4, 4).save(dir.path().join("a.png")).unwrap();

        let handle = EngineHandle::spawn(CrashingLoader, 4).unwrap();
        handle.load_model(ModelIdentity::new("crashing", "v1")).wait().unwrap();
        let result = handle.index_directory(dir.path()).wait();
        assert!(matches!(result, Err(Error::EngineStopped)));

        // 线程退出前提交的请求也会失败，退出后提交失败会清除索引状态
        let mut stopped = false;
        for _ in 0..200 {
            let result = handle.index_directory(dir.path()).wait();
            assert!(matches!(result, Err(Error::EngineStopped)));
            if !handle.is_indexing() {
                stopped = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(stopped);

        let result = handle.search(Query::Text("cat".to_string()), 3).wait();
        assert!(matches!(result, Err(Error::EngineStopped)));
    }

    #[test]
    fn handle_serves_requests_in_order() {
        let handle = EngineHandle::spawn(ConstantLoader, 4).unwrap();
        handle.load_model(ModelIdentity::new("constant", "v1")).wait().unwrap();
        let result = handle.search(Query::Text("cat".to_string()), 3).wait();
        assert!(matches!(result, Err(Error::NoIndexAvailable)));
        drop(handle);
    }
}
