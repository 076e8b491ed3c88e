//! A collection of useful items intended to be glob imported when building
//! applications on Arbor.

pub use crate::config::Config;
pub use crate::context::data::{Data, Dependencies, FactoryContext, Outcome, Patch};
pub use crate::context::Context;
pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::{HttpError, Result};
pub use crate::handler::HandlerResult;
pub use crate::module::memory::MemoryResolver;
pub use crate::module::{Module, ModuleBuilder, ModuleResolver, ModuleStat, ModuleUrl};
pub use crate::response::{ResponseHandle, SseEvent, SseOptions, StreamOptions};
pub use crate::router::table::RouteTable;
