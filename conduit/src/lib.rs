//! Thin facade over `conduit-core`: re-exports the engine plus a convenience prelude.

pub use conduit_core::*;

pub mod prelude {
    pub use conduit_core::prelude::*;
}
