//! The built-in pipes, sources and spouts.

mod pipes;
mod sources;
mod spouts;

pub use pipes::{Join, Lower, Repeat, Reverse, Split, Upper};
pub use sources::{Arg, Output};
pub use spouts::{Print, Say};

use crate::registry::NativeRegistry;

/// A registry holding every built-in.
pub fn default_registry() -> NativeRegistry {
    let mut registry = NativeRegistry::new();
    register_defaults(&mut registry);
    registry
}

/// Register every built-in into `registry`. Names already taken are skipped
/// with a warning.
pub fn register_defaults(registry: &mut NativeRegistry) {
    let results = [
        registry.register_pipe(Upper::new()),
        registry.register_pipe(Lower::new()),
        registry.register_pipe(Reverse::new()),
        registry.register_pipe(Join::new()),
        registry.register_pipe(Split::new()),
        registry.register_pipe(Repeat::new()),
        registry.register_source(Arg::new()),
        registry.register_source(Output::new()),
        registry.register_spout(Print::new()),
        registry.register_spout(Say::new()),
    ];
    for result in results {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Skipped built-in");
        }
    }
}
