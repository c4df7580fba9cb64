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

use crate::strata::k8s::client::ClusterObject;
use crate::strata::k8s::meta::ObjectReference;
use crate::strata::logger::log_info;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const DEFAULT_EVENT_RETENTION: usize = 1024;

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Minimal representation of a core/v1 Event posted on an owner object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    #[serde(rename = "type")]
    pub event_type: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTimestamp")]
    pub last_timestamp: DateTime<Utc>,
}

/// Builds an owner reference for event recording.
pub fn object_reference<T: ClusterObject>(object: &T) -> ObjectReference {
    let meta = object.metadata();
    ObjectReference {
        api_version: None,
        kind: Some(T::KIND.to_string()),
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        uid: meta.uid.clone(),
        resource_version: None,
    }
}

/// Bounded in-memory event sink shared by all reconcilers.
#[derive(Clone)]
pub struct EventRecorder {
    inner: Arc<Mutex<VecDeque<Event>>>,
    component: &'static str,
}

impl EventRecorder {
    pub fn new(component: &'static str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(DEFAULT_EVENT_RETENTION))),
            component,
        }
    }

    pub fn event<T: ClusterObject>(
        &self,
        owner: &T,
        event_type: &str,
        reason: &str,
        message: impl Into<String>,
    ) {
        let message = message.into();
        let involved = object_reference(owner);
        let owner_name = involved.name.clone().unwrap_or_default();
        log_info(
            self.component,
            "Recorded event",
            &[
                ("owner", owner_name.as_str()),
                ("kind", T::KIND),
                ("type", event_type),
                ("reason", reason),
                ("message", message.as_str()),
            ],
        );
        let mut events = self.inner.lock().expect("event recorder poisoned");
        if events.len() == DEFAULT_EVENT_RETENTION {
            events.pop_front();
        }
        events.push_back(Event {
            involved_object: involved,
            event_type: event_type.to_string(),
            reason: reason.to_string(),
            message,
            last_timestamp: Utc::now(),
        });
    }

    /// Returns all recorded events for the named owner object.
    pub fn events_for(&self, owner_name: &str) -> Vec<Event> {
        let events = self.inner.lock().expect("event recorder poisoned");
        events
            .iter()
            .filter(|e| e.involved_object.name.as_deref() == Some(owner_name))
            .cloned()
            .collect()
    }

    pub fn has_event(&self, owner_name: &str, reason: &str) -> bool {
        self.events_for(owner_name)
            .iter()
            .any(|e| e.reason == reason)
    }
}
