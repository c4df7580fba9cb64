/*
 * Copyright (C) 2024 The Strata Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fmt;

/// Boxed error type shared across the crate.
pub type DynError = Box<dyn Error + Send + Sync>;

#[derive(Debug)]
struct ContextError {
    context: String,
    source: DynError,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for MessageError {}

/// Wraps an error with a context message, preserving the source chain.
pub fn with_context<E>(error: E, context: impl Into<String>) -> DynError
where
    E: Into<DynError>,
{
    Box::new(ContextError {
        context: context.into(),
        source: error.into(),
    })
}

/// Creates a new error from a plain message.
pub fn new_error(message: impl Into<String>) -> DynError {
    Box::new(MessageError(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_chain_is_preserved() {
        let root = new_error("disk on fire");
        let wrapped = with_context(root, "commit layer");
        assert_eq!(wrapped.to_string(), "commit layer: disk on fire");
        assert!(wrapped.source().is_some());
    }

    #[test]
    fn message_error_displays_verbatim() {
        assert_eq!(new_error("plain").to_string(), "plain");
    }
}
