// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(clippy::all)]
//! The error type shared by the wicket crates.
//!
//! A proxy transaction can die in a handful of well-known places: the
//! listener, a socket read or write, the origin dial, a cache file, or a
//! broken invariant inside the proxy itself. [ErrorKind] names those
//! places; an [Error] pairs a kind with free-form context and, when a
//! lower-level failure triggered it, the boxed cause. Errors travel boxed
//! ([BError]) so a `Result` stays one pointer wide.
//!
//! The [OrErr] trait is the seam where foreign errors (`std::io`, serde,
//! and friends) enter wicket code:
//!
//! ```
//! use wicket_error::{ErrorKind::*, OrErr, Result};
//!
//! fn read_conf(path: &str) -> Result<String> {
//!     std::fs::read_to_string(path)
//!         .or_err_with(FileReadError, || format!("while loading {path}"))
//! }
//! ```

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

/// The boxed [Error], the form errors travel in.
pub type BError = Box<Error>;
/// Syntax sugar for `std::result::Result<T, BError>`.
pub type Result<T, E = BError> = std::result::Result<T, E>;

/// Where a proxy operation can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The listening socket could not be created or bound.
    BindError,
    /// `accept()` failed on the listener.
    AcceptError,
    /// A socket option could not be applied.
    SocketError,
    /// The origin could not be dialed.
    ConnectError,
    /// A read on an established connection failed.
    ReadError,
    /// A write on an established connection failed.
    WriteError,
    /// A header name or value violates the HTTP grammar.
    InvalidHTTPHeader,
    // cache blob files
    FileOpenError,
    FileCreateError,
    FileReadError,
    FileWriteError,
    FileRemoveError,
    /// The configuration file is missing, unreadable or malformed.
    ConfError,
    /// A broken invariant inside the proxy itself.
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BindError => "BindError",
            ErrorKind::AcceptError => "AcceptError",
            ErrorKind::SocketError => "SocketError",
            ErrorKind::ConnectError => "ConnectError",
            ErrorKind::ReadError => "ReadError",
            ErrorKind::WriteError => "WriteError",
            ErrorKind::InvalidHTTPHeader => "InvalidHTTPHeader",
            ErrorKind::FileOpenError => "FileOpenError",
            ErrorKind::FileCreateError => "FileCreateError",
            ErrorKind::FileReadError => "FileReadError",
            ErrorKind::FileWriteError => "FileWriteError",
            ErrorKind::FileRemoveError => "FileRemoveError",
            ErrorKind::ConfError => "ConfError",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

/// One failure: its kind, optional context, optional cause.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: Option<Cow<'static, str>>,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    /// An error with no further detail.
    pub fn new(kind: ErrorKind) -> BError {
        Box::new(Error {
            kind,
            context: None,
            cause: None,
        })
    }

    /// An error with a context string describing what was being attempted.
    pub fn explain(kind: ErrorKind, context: impl Into<Cow<'static, str>>) -> BError {
        Box::new(Error {
            kind,
            context: Some(context.into()),
            cause: None,
        })
    }

    /// Shorthand for `Err(Error::explain(..))`.
    pub fn e_explain<T>(kind: ErrorKind, context: impl Into<Cow<'static, str>>) -> Result<T> {
        Err(Self::explain(kind, context))
    }

    /// An error wrapping the lower-level failure that produced it.
    ///
    /// Reach for this only when the context adds something the cause does
    /// not already say on its own.
    pub fn because(
        kind: ErrorKind,
        context: impl Into<Cow<'static, str>>,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> BError {
        Box::new(Error {
            kind,
            context: Some(context.into()),
            cause: Some(cause.into()),
        })
    }

    /// Shorthand for `Err(Error::because(..))`.
    pub fn e_because<T>(
        kind: ErrorKind,
        context: impl Into<Cow<'static, str>>,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Result<T> {
        Err(Self::because(kind, context, cause))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        if let Some(context) = &self.context {
            write!(f, ": {context}")?;
        }
        if let Some(cause) = &self.cause {
            // a nested Error renders its own chain the same way
            write!(f, ": caused by {cause}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn StdError + 'static))
    }
}

/// The seam where foreign error types enter wicket code: tag them with an
/// [ErrorKind] and context, keeping the original as the cause.
pub trait OrErr<T, E> {
    /// Wrap the error as the cause of a new [Error] of the given kind.
    fn or_err(self, kind: ErrorKind, context: &'static str) -> Result<T>
    where
        E: Into<Box<dyn StdError + Send + Sync>>;

    /// Like [or_err](OrErr::or_err), with the context string built lazily;
    /// useful when the context needs formatting.
    fn or_err_with<C, F>(self, kind: ErrorKind, context: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
        E: Into<Box<dyn StdError + Send + Sync>>;

    /// Keep only a rendering of the original error instead of the error
    /// itself; for error types that cannot leave their scope.
    fn explain_err<C, F>(self, kind: ErrorKind, render: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce(E) -> C;
}

impl<T, E> OrErr<T, E> for std::result::Result<T, E> {
    fn or_err(self, kind: ErrorKind, context: &'static str) -> Result<T>
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.map_err(|e| Error::because(kind, context, e))
    }

    fn or_err_with<C, F>(self, kind: ErrorKind, context: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.map_err(|e| Error::because(kind, context(), e))
    }

    fn explain_err<C, F>(self, kind: ErrorKind, render: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce(E) -> C,
    {
        self.map_err(|e| Error::explain(kind, render(e)))
    }
}
