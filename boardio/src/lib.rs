//! Provider and platform registry for single-board computer I/O.
//!
//! A [`Context`] owns three stores:
//!
//! - the [`registry::Registry`] of live I/O handles, keyed by unique id,
//! - the [`provider::ProvidersManager`], one backend per I/O type with a
//!   priority-chosen default,
//! - the [`platform::PlatformsManager`], named bundles of providers with a
//!   weight-chosen default.
//!
//! Handles are created through the context from typed configs:
//!
//! ```no_run
//! use boardio::config::DigitalOutputConfig;
//! use boardio::io::{kind, DigitalOutput};
//! use boardio::ContextBuilder;
//!
//! # fn main() -> boardio::Result<()> {
//! let ctx = ContextBuilder::standard()?.auto_detect(true).build()?;
//! let config = DigitalOutputConfig::builder().id("led").address(17).build()?;
//! let led = ctx.create::<kind::DigitalOutput>(config)?;
//! led.toggle()?;
//! ctx.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! Backends live in [`linuxfs`] (sysfs and i2c-dev) and [`mock`] (in-memory).

pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod io;
pub mod linuxfs;
pub mod mock;
pub mod platform;
pub mod provider;
pub mod registry;
pub mod tracing;

pub use context::{Context, ContextBuilder};
pub use error::{BusError, Collection, Error, Result};
pub use identity::Identity;
pub use io::{IoInstance, IoKind, IoType};
