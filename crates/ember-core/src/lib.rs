//! # ember-core
//!
//! Core data structures shared by the ember interpreter and its passes:
//!
//! - [`ir`] — A-normal-form expressions, types and modules
//! - [`value`] — runtime values with pinned-resource lifetime extension
//! - [`binding`] — the registry of managed variables
//! - [`op`] — operator definitions, calling convention and dispatch registry
//! - [`memory`], [`stream`], [`comm`] — resource contracts consumed during
//!   primitive dispatch
//! - [`DType`], [`Shape`], [`Layout`] — tensor metadata

pub mod binding;
pub mod comm;
pub mod device;
pub mod dtype;
pub mod error;
pub mod ir;
pub mod layout;
pub mod memory;
pub mod op;
pub mod shape;
pub mod stream;
pub mod value;

pub use binding::{BindingEntry, BindingTable, GradTape};
pub use device::{Device, DeviceKind};
pub use dtype::{DType, WithDType};
pub use error::{Error, ErrorKind, Result};
pub use layout::Layout;
pub use shape::Shape;
pub use value::{HostObject, TensorValue, TupleValue, Value};
