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

use crate::strata::logger::log_info;
use crate::strata::util::error::{with_context, DynError};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit code of a forced termination after the second interrupt.
pub const EXIT_FORCED: i32 = 254;

/// Installs the interrupt handler: the first SIGINT/SIGTERM cancels the
/// returned token so in-flight operations unwind cleanly; the second
/// terminates the process unconditionally.
pub fn install() -> Result<CancellationToken, DynError> {
    let token = CancellationToken::new();
    let mut interrupt =
        signal(SignalKind::interrupt()).map_err(|e| with_context(e, "install SIGINT handler"))?;
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| with_context(e, "install SIGTERM handler"))?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        log_info("signal", "Received termination signal - terminating", &[]);
        cancel.cancel();
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        log_info("signal", "Received 2nd termination signal - exiting forcefully", &[]);
        std::process::exit(EXIT_FORCED);
    });
    Ok(token)
}
