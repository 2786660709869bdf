//! SchedulerBuilder - スケジューラの構築とワイヤリング
//!
//! # 設計原則
//! - 起動時検証（Fail-fast 設計）: 設定・ストア・ハンドラの不備は build() で返す
//! - 既定値: Clock は SystemClock、ID は UlidGenerator
//! - テスト容易性: Clock / Store / IdGenerator を差し替え可能

use std::sync::Arc;

use crate::app::handler::{BatchHandler, HandlerRegistry};
use crate::app::{ConfigError, RecordAccess, Scheduler, SchedulerConfig};
use crate::domain::SchedulerError;
use crate::ports::{Clock, IdGenerator, RecordStore, SystemClock, UlidGenerator};

/// SchedulerBuilder は Scheduler を構築
///
/// # 使用例
/// ```ignore
/// let scheduler = Scheduler::builder()
///     .config(SchedulerConfig::default().with_interval_ms(10_000))
///     .store(Arc::new(JsonFileStore::open("./data")?))
///     .handler(handler_fn("upload", upload))?
///     .expect_handlers(&["upload"])
///     .build()?;
/// scheduler.start();
/// ```
#[derive(Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn RecordStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    handlers: HandlerRegistry,
    expected_handlers: Option<Vec<String>>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no record store configured")]
    MissingStore,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Missing handlers: {0:?}. These handlers were expected but not registered.")]
    MissingHandlers(Vec<String>),
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Handler を登録（名前が空・重複なら InvalidHandler）
    pub fn handler<H: BatchHandler + 'static>(mut self, handler: H) -> Result<Self, SchedulerError> {
        self.handlers.register(Arc::new(handler))?;
        Ok(self)
    }

    /// build() 時に登録済みであるべきハンドラ名
    pub fn expect_handlers(mut self, names: &[&str]) -> Self {
        self.expected_handlers = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// 検証して Scheduler を生成
    ///
    /// # 検証
    /// - ストアが設定されていること
    /// - SchedulerConfig::validate() を通ること
    /// - expect_handlers() の名前が全て登録されていること
    pub fn build(self) -> Result<Scheduler, BuildError> {
        let store = self.store.ok_or(BuildError::MissingStore)?;
        self.config.validate()?;

        if let Some(expected) = &self.expected_handlers {
            let registered = self.handlers.names();
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !registered.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())) as Arc<dyn IdGenerator>);
        let access = RecordAccess::new(store, clock, Arc::new(self.config));

        Ok(Scheduler::from_parts(access, ids, self.handlers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::handler::handler_fn;
    use crate::domain::TaskId;
    use crate::impls::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SeqIds(AtomicUsize);

    impl IdGenerator for SeqIds {
        fn generate_task_id(&self) -> TaskId {
            TaskId::new(format!("id-{}", self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[test]
    fn test_build_requires_store() {
        let result = SchedulerBuilder::new().build();
        assert!(matches!(result, Err(BuildError::MissingStore)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = SchedulerBuilder::new()
            .store(Arc::new(InMemoryStore::new()))
            .config(SchedulerConfig::default().with_interval_ms(0))
            .build();
        assert!(matches!(result, Err(BuildError::Config(ConfigError::Invalid(_)))));
    }

    #[test]
    fn test_build_missing_handlers() {
        let result = SchedulerBuilder::new()
            .store(Arc::new(InMemoryStore::new()))
            .handler(handler_fn("upload", |_| async { Ok(()) }))
            .unwrap()
            .expect_handlers(&["upload", "audit"])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingHandlers(missing)) if missing == vec!["audit".to_string()]
        ));
    }

    #[test]
    fn test_duplicate_handler_is_rejected() {
        let result = SchedulerBuilder::new()
            .handler(handler_fn("upload", |_| async { Ok(()) }))
            .unwrap()
            .handler(handler_fn("upload", |_| async { Ok(()) }));
        assert!(matches!(result, Err(SchedulerError::InvalidHandler(_))));
    }

    #[test]
    fn test_custom_id_generator_is_used() {
        let scheduler = SchedulerBuilder::new()
            .store(Arc::new(InMemoryStore::new()))
            .id_generator(Arc::new(SeqIds(AtomicUsize::new(0))))
            .build()
            .unwrap();

        let a = scheduler.push(json!("a")).unwrap().unwrap();
        let b = scheduler.push(json!("b")).unwrap().unwrap();
        assert_eq!(a.as_str(), "id-0");
        assert_eq!(b.as_str(), "id-1");
    }

    #[test]
    fn test_defaults_are_applied() {
        let scheduler = SchedulerBuilder::new()
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap();
        assert_eq!(scheduler.config(), &SchedulerConfig::default());
        assert!(scheduler.handler_names().is_empty());
    }
}
