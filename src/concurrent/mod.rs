mod handle;
mod metrics;
mod pool;

pub use handle::TaskHandle;
pub use metrics::PoolMetrics;
pub use pool::TaskPool;

use std::any::Any;

/// Best-effort rendering of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
