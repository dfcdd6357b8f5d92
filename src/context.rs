//! Shared context: the explicit services passed into components instead of
//! process singletons.

use crate::cache::manager::CacheManager;
use crate::domain::device::DeviceRegistry;
use crate::domain::uid::UidAllocator;
use crate::infrastructure::events::EventBus;
use crate::ops::manager::OpManager;
use std::sync::Arc;

/// Handle bundle handed to anything that needs backend access.
#[derive(Clone)]
pub struct AgentContext {
	pub events: Arc<EventBus>,
	pub allocator: Arc<UidAllocator>,
	pub registry: Arc<DeviceRegistry>,
	pub cache: Arc<CacheManager>,
	pub ops: Arc<OpManager>,
}
