//! Event Entry Implementation
//!
//! An [`EventEntry`] is one reusable slot record. Entries are allocated once when the
//! ring buffer is built and then recycled forever: the parameter slots and the
//! payload buffer are reset between uses, never reallocated.

use crate::router::{Result, RouterError};
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Severity of a telemetry event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Level {
    /// The lower-case name of this level
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Level> for tracing::Level {
    fn from(level: Level) -> Self {
        match level {
            Level::Trace => tracing::Level::TRACE,
            Level::Debug => tracing::Level::DEBUG,
            Level::Info => tracing::Level::INFO,
            Level::Warn => tracing::Level::WARN,
            Level::Error => tracing::Level::ERROR,
        }
    }
}

/// A resettable event parameter
///
/// Primitives are stored inline. Strings borrow `'static` data when they can, and
/// arbitrary objects are shared behind an `Arc`. [`Value::reset`] drops whatever the
/// slot was holding so a recycled entry never keeps an old object alive.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Empty,
    Bool(bool),
    Char(char),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(Cow<'static, str>),
    Object(Arc<dyn fmt::Debug + Send + Sync>),
}

impl Value {
    /// Drop the held value, leaving the slot empty
    #[inline]
    pub fn reset(&mut self) {
        *self = Value::Empty;
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// Wrap an arbitrary shared object
    pub fn object<T>(value: T) -> Self
    where
        T: fmt::Debug + Send + Sync + 'static,
    {
        Value::Object(Arc::new(value))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => f.write_str("Empty"),
            Value::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Value::Char(v) => f.debug_tuple("Char").field(v).finish(),
            Value::I64(v) => f.debug_tuple("I64").field(v).finish(),
            Value::U64(v) => f.debug_tuple("U64").field(v).finish(),
            Value::F64(v) => f.debug_tuple("F64").field(v).finish(),
            Value::Str(v) => f.debug_tuple("Str").field(v).finish(),
            Value::Object(v) => f.debug_tuple("Object").field(v).finish(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => Ok(()),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Char(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
            Value::Object(v) => write!(f, "{v:?}"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Empty, Value::Empty) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident as $target:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(<$target>::from(value))
                }
            }
        )*
    };
}

impl_value_from! {
    bool => Bool as bool,
    char => Char as char,
    i8 => I64 as i64,
    i16 => I64 as i64,
    i32 => I64 as i64,
    i64 => I64 as i64,
    u8 => U64 as u64,
    u16 => U64 as u64,
    u32 => U64 as u64,
    u64 => U64 as u64,
    f32 => F64 as f64,
    f64 => F64 as f64,
}

impl From<&'static str> for Value {
    fn from(value: &'static str) -> Self {
        Value::Str(Cow::Borrowed(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Cow::Owned(value))
    }
}

/// Fixed-capacity byte buffer
///
/// Writes past the construction capacity are truncated, never grown into. The
/// truncation is remembered until the next [`Payload::clear`].
#[derive(Debug)]
pub struct Payload {
    bytes: Vec<u8>,
    capacity: usize,
    truncated: bool,
}

impl Payload {
    /// Create a payload buffer holding at most `capacity` bytes
    ///
    /// # Errors
    /// Returns `RouterError::AllocationFailed` if the buffer cannot be reserved
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(capacity)
            .map_err(|_| RouterError::AllocationFailed {
                what: "payload bytes",
                requested: capacity,
            })?;
        Ok(Self {
            bytes,
            capacity,
            truncated: false,
        })
    }

    /// Forget the contents while keeping the allocation
    #[inline]
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.truncated = false;
    }

    /// Append as much of `data` as fits, returning the number of bytes taken
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let room = self.remaining();
        let taken = data.len().min(room);
        self.bytes.extend_from_slice(&data[..taken]);
        if taken < data.len() {
            self.truncated = true;
        }
        taken
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The contents as UTF-8, if they are valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The fixed capacity this buffer was built with
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    /// Whether a write since the last clear did not fit
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Address of the backing storage, stable for the buffer's lifetime
    pub fn storage_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

impl io::Write for Payload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.extend(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Write for Payload {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if s.len() > self.remaining() {
            // Cut on a char boundary so the payload stays valid UTF-8
            let mut end = self.remaining();
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            self.extend(&s.as_bytes()[..end]);
            self.truncated = true;
            return Err(fmt::Error);
        }
        self.extend(s.as_bytes());
        Ok(())
    }
}

/// One in-flight telemetry event
///
/// Between claim and publish exactly one producer owns an entry; between publish and
/// consumption exactly one consumer reads it.
#[derive(Debug)]
pub struct EventEntry {
    pub(crate) sequence: i64,
    pub timestamp_nanos: i64,
    pub level: Level,
    pub destination_index: u32,
    pub source: Option<Cow<'static, str>>,
    pub template: Option<Cow<'static, str>>,
    pub parse: bool,
    parameters: Box<[Value]>,
    parameter_count: usize,
    payload: Payload,
    pub(crate) end_of_batch: bool,
    pub(crate) abandoned: bool,
}

impl EventEntry {
    /// Create an entry with fixed parameter and payload capacities
    ///
    /// # Errors
    /// Returns `RouterError::AllocationFailed` if either store cannot be reserved
    pub fn new(max_parameters: usize, payload_capacity: usize) -> Result<Self> {
        let mut parameters = Vec::new();
        parameters
            .try_reserve_exact(max_parameters)
            .map_err(|_| RouterError::AllocationFailed {
                what: "parameter slots",
                requested: max_parameters,
            })?;
        parameters.resize_with(max_parameters, Value::default);

        Ok(Self {
            sequence: crate::router::INITIAL_CURSOR_VALUE,
            timestamp_nanos: 0,
            level: Level::default(),
            destination_index: 0,
            source: None,
            template: None,
            parse: false,
            parameters: parameters.into_boxed_slice(),
            parameter_count: 0,
            payload: Payload::with_capacity(payload_capacity)?,
            end_of_batch: false,
            abandoned: false,
        })
    }

    /// Return the entry to its freshly-claimed state
    ///
    /// Drops every reference the previous event held; allocations are kept.
    pub fn reset(&mut self) {
        self.timestamp_nanos = 0;
        self.level = Level::default();
        self.destination_index = 0;
        self.source = None;
        self.template = None;
        self.parse = false;
        for slot in &mut self.parameters[..self.parameter_count] {
            slot.reset();
        }
        self.parameter_count = 0;
        self.payload.clear();
        self.end_of_batch = false;
        self.abandoned = false;
    }

    /// The ring sequence this entry was last claimed for
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// True on the last entry of a contiguous batch handed to the registry
    pub fn end_of_batch(&self) -> bool {
        self.end_of_batch
    }

    /// Append a parameter
    ///
    /// # Returns
    /// `false` if every slot is already taken; the value is dropped in that case
    pub fn push_parameter(&mut self, value: impl Into<Value>) -> bool {
        if self.parameter_count == self.parameters.len() {
            return false;
        }
        self.parameters[self.parameter_count] = value.into();
        self.parameter_count += 1;
        true
    }

    /// The parameters pushed since the last reset
    pub fn parameters(&self) -> &[Value] {
        &self.parameters[..self.parameter_count]
    }

    /// Number of parameter slots this entry was built with
    pub fn parameter_capacity(&self) -> usize {
        self.parameters.len()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }
}
