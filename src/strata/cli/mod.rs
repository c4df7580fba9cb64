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

pub mod args;
pub mod commands;
pub mod signal;

use crate::strata::logger::set_debug;
use crate::strata::util::error::DynError;
use clap::Parser;

pub async fn run() -> Result<(), DynError> {
    let cli = args::Strata::parse();
    let settings = args::resolve_settings(&cli);
    set_debug(settings.debug);
    let cancellation = signal::install()?;

    match &cli.command {
        args::Commands::Mount(mount_args) => {
            commands::mount::run(mount_args, &settings, &cancellation).await
        }
        args::Commands::Umount(umount_args) => {
            commands::umount::run(umount_args, &settings, &cancellation).await
        }
        args::Commands::Prune => commands::prune::run(&settings, &cancellation).await,
        args::Commands::Manager(manager_args) => {
            commands::manager::run(manager_args, &cancellation).await
        }
    }
}
