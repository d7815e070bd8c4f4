//! Contract between the host and the embedded guest interpreter.
//!
//! The interpreter itself is an external collaborator. The host only needs to
//! load a chunk into a function, wrap it in a coroutine, resume that coroutine
//! with arguments, publish globals and preloadable modules, and ask for a
//! garbage collection pass. The sandbox (no precompiled chunks, bounded step
//! time) is part of the contract: [`RuntimeLimits`] is handed to the factory
//! and [`reject_bytecode`] is enforced on the host side as well.

use std::{rc::Rc, time::Duration};

use thiserror::Error;

use crate::{
    fs_error::FsError, memory::MemoryError, resource::ResourceError, sound::SoundError,
    value::Value,
};

/// Leading byte of every precompiled chunk.
pub const BYTECODE_SIGNATURE: u8 = 0x1B;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GuestError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("{0}")]
    Runtime(String),
    #[error("script exceeded its time limit")]
    Timeout,
    #[error("bad argument #{index} to '{function}' ({message})")]
    BadArgument {
        function: String,
        index: usize,
        message: String,
    },
    #[error("attempt to call unknown function '{0}'")]
    UnknownFunction(String),
}

impl From<ResourceError> for GuestError {
    fn from(e: ResourceError) -> Self {
        GuestError::Runtime(e.to_string())
    }
}

impl From<MemoryError> for GuestError {
    fn from(_: MemoryError) -> Self {
        GuestError::Runtime("not enough memory".to_string())
    }
}

impl From<FsError> for GuestError {
    fn from(e: FsError) -> Self {
        GuestError::Runtime(e.to_string())
    }
}

impl From<SoundError> for GuestError {
    fn from(e: SoundError) -> Self {
        GuestError::Runtime(e.to_string())
    }
}

/// What a host function hands back to the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResult {
    Return(Vec<Value>),
    /// Suspend the calling coroutine, yielding these values to the host.
    Yield(Vec<Value>),
}

impl ApiResult {
    pub fn none() -> Self {
        ApiResult::Return(Vec::new())
    }

    pub fn one(value: impl Into<Value>) -> Self {
        ApiResult::Return(vec![value.into()])
    }
}

/// A table of host functions published to the guest.
pub trait GuestApi {
    fn name(&self) -> &str;
    fn functions(&self) -> &[&'static str];
    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId(pub u32);

/// Outcome of a single resume.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumed {
    Yielded(Vec<Value>),
    Finished(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLimits {
    pub step_time_limit: Duration,
    pub instruction_limit: u64,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            step_time_limit: Duration::from_millis(5000),
            instruction_limit: 1_000_000,
        }
    }
}

pub trait GuestRuntime {
    fn load(&mut self, chunk_name: &str, source: &[u8]) -> Result<FunctionId, GuestError>;
    fn create_coroutine(&mut self, function: FunctionId) -> Result<CoroutineId, GuestError>;
    fn resume(&mut self, coroutine: CoroutineId, args: Vec<Value>)
        -> Result<Resumed, GuestError>;
    fn set_global(&mut self, name: &str, value: Value);
    /// Registers `api` so the guest can `require` it by `name`. It must not
    /// become a bare global.
    fn set_preload(&mut self, name: &str, api: Rc<dyn GuestApi>);
    fn collect_garbage(&mut self);
}

/// Builds a fresh sandboxed interpreter for each boot.
pub trait GuestRuntimeFactory {
    fn create(&self, limits: RuntimeLimits) -> Box<dyn GuestRuntime>;
}

impl<F> GuestRuntimeFactory for F
where
    F: Fn(RuntimeLimits) -> Box<dyn GuestRuntime>,
{
    fn create(&self, limits: RuntimeLimits) -> Box<dyn GuestRuntime> {
        self(limits)
    }
}

pub fn reject_bytecode(chunk_name: &str, source: &[u8]) -> Result<(), GuestError> {
    if source.first() == Some(&BYTECODE_SIGNATURE) {
        return Err(GuestError::Syntax(format!(
            "{}: attempt to load a binary chunk",
            chunk_name
        )));
    }
    Ok(())
}

pub fn arg(args: &[Value], index: usize) -> Option<&Value> {
    args.get(index).filter(|v| !v.is_nil())
}

fn bad_arg(function: &str, index: usize, expected: &str, got: Option<&Value>) -> GuestError {
    GuestError::BadArgument {
        function: function.to_string(),
        index: index + 1,
        message: format!(
            "{} expected, got {}",
            expected,
            got.map_or("nil", Value::type_name)
        ),
    }
}

pub fn arg_str<'a>(function: &str, args: &'a [Value], index: usize) -> Result<&'a str, GuestError> {
    let value = arg(args, index);
    value
        .and_then(Value::as_str)
        .ok_or_else(|| bad_arg(function, index, "string", value))
}

pub fn arg_bytes<'a>(
    function: &str,
    args: &'a [Value],
    index: usize,
) -> Result<&'a [u8], GuestError> {
    let value = arg(args, index);
    value
        .and_then(Value::as_bytes)
        .ok_or_else(|| bad_arg(function, index, "string", value))
}

pub fn arg_i64(function: &str, args: &[Value], index: usize) -> Result<i64, GuestError> {
    let value = arg(args, index);
    value
        .and_then(Value::as_i64)
        .ok_or_else(|| bad_arg(function, index, "integer", value))
}

pub fn arg_usize(function: &str, args: &[Value], index: usize) -> Result<usize, GuestError> {
    let n = arg_i64(function, args, index)?;
    usize::try_from(n).map_err(|_| GuestError::BadArgument {
        function: function.to_string(),
        index: index + 1,
        message: "value must not be negative".to_string(),
    })
}

pub fn arg_f64(function: &str, args: &[Value], index: usize) -> Result<f64, GuestError> {
    let value = arg(args, index);
    value
        .and_then(Value::as_f64)
        .ok_or_else(|| bad_arg(function, index, "number", value))
}
