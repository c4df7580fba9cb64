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

use std::process::exit;
use strata::strata::cli;
use strata::strata::logger::log_error;

#[tokio::main]
async fn main() {
    match cli::run().await {
        Ok(()) => {}
        Err(err) => {
            log_error("cli", "Command failed", &[("error", &err.to_string())]);
            exit(1);
        }
    }
}
