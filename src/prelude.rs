//! Common imports threaded through every module, in the teacher's `prelude::*` style.

#[allow(unused_imports)]
pub(crate) use alloc::{boxed::Box, string::String, vec, vec::Vec};

#[allow(unused_imports)]
pub(crate) use core::{any::Any, fmt::Write, marker::PhantomData, str};

pub use eonix_errno::{Errno, KResult};
