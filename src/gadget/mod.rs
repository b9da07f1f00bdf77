//! USB network gadget management
//!
//! ```text
//! GadgetLifecycle (cleanup → configure → controller → bind → link up)
//!     ├── GadgetBuilder
//!     │       ├── ConfigfsGadget (ecm/rndis functions)
//!     │       └── CommandGadget (external setup script)
//!     └── ControllerDriver (modprobe load/reload)
//! ```

pub mod builder;
pub mod configfs;
pub mod driver;
pub mod function;
pub mod lifecycle;

pub use builder::{builder_from_config, CommandGadget, ConfigfsGadget, GadgetBuilder};
pub use driver::{driver_from_config, BuiltinDriver, ControllerDriver, ModprobeDriver};
pub use function::{GadgetFunction, NetFunction, NetFunctionKind};
pub use lifecycle::{GadgetControl, GadgetLifecycle};
