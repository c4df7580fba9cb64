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

use crate::strata::cache::CacheStore;
use crate::strata::cli::commands::new_store;
use crate::strata::config::Settings;
use crate::strata::util::error::DynError;
use tokio_util::sync::CancellationToken;

pub async fn run(settings: &Settings, cancellation: &CancellationToken) -> Result<(), DynError> {
    let store = new_store(settings)?;
    store.prune(cancellation).await
}
