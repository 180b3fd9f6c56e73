//! EventSink port - 診断イベントの記録
//!
//! # 実装
//! - `impls::InMemoryEventLog`: 追記専用のメモリ内ログ
//! - `NoopEventSink`: 何もしない

use crate::domain::DomainEvent;

/// EventSink はドメインイベントを記録
///
/// 記録は失敗しない。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}
