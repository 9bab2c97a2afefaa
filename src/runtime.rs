//! Shared runtime context: the read pool and default channel config.

use std::sync::Arc;
use std::sync::OnceLock;

use tracing::info;

use crate::config::{ChannelConfig, ReadPoolConf};
use crate::error::ChannelError;
use crate::readpool::ReadPool;

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

/// The context every strap and channel runs in: one shared read pool
/// plus the channel config applied when a strap carries no override.
///
/// Constructors that do not take a runtime consult the process-wide
/// default, installing built-in defaults on first use.
pub struct Runtime {
    read_pool: Arc<ReadPool>,
    channel_conf: ChannelConfig,
}

impl Runtime {
    /// Build a runtime from validated configuration. Must be called on
    /// a Tokio runtime (the pool spawns its workers eagerly).
    pub fn new(pool_conf: ReadPoolConf, channel_conf: ChannelConfig) -> Result<Arc<Self>, ChannelError> {
        pool_conf.validate()?;
        channel_conf.validate()?;
        Ok(Arc::new(Runtime {
            read_pool: ReadPool::new(&pool_conf),
            channel_conf,
        }))
    }

    /// Install the process-wide default runtime. Invalid configuration
    /// and double initialization are programming errors and panic.
    pub fn init_global(pool_conf: ReadPoolConf, channel_conf: ChannelConfig) -> Arc<Runtime> {
        info!(?pool_conf, ?channel_conf, "installing global runtime");
        let runtime = match Runtime::new(pool_conf, channel_conf) {
            Ok(runtime) => runtime,
            Err(err) => panic!("invalid global runtime configuration: {err}"),
        };
        if GLOBAL.set(Arc::clone(&runtime)).is_err() {
            panic!("global runtime already initialized");
        }
        runtime
    }

    /// The process-wide default runtime, installing built-in defaults
    /// on first use.
    pub fn global() -> Arc<Runtime> {
        Arc::clone(GLOBAL.get_or_init(|| {
            let pool_conf = ReadPoolConf::default();
            let channel_conf = ChannelConfig::default();
            info!(?pool_conf, ?channel_conf, "installing default global runtime");
            match Runtime::new(pool_conf, channel_conf) {
                Ok(runtime) => runtime,
                // Built-in defaults always validate.
                Err(err) => panic!("default runtime configuration rejected: {err}"),
            }
        }))
    }

    pub fn read_pool(&self) -> &Arc<ReadPool> {
        &self.read_pool
    }

    pub fn channel_conf(&self) -> &ChannelConfig {
        &self.channel_conf
    }
}
