// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resubmission Timer (§4.8): a minimal scheduled-callback utility that posts an event
//! back onto the scheduler's channel after a delay. Used to debounce fetch-failure bursts
//! into a single `ResubmitFailedStages` and to retry barrier-stage admission.
//!
//! The upstream system backs this with one daemon thread running a scheduled executor;
//! here a detached `tokio::spawn`'d sleep plays the same role, since the event loop
//! itself already runs as a tokio task (§5's "Runtime" note) and every timer fire is just
//! another send onto the same unbounded channel external callers use.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::event::SchedulerEvent;

/// Posts `event` onto `event_tx` after `delay`, dropping the send silently if the
/// scheduler has already shut down (the channel's receiver gone). Fire-and-forget: the
/// caller does not get a handle back, matching the upstream scheduled executor's
/// one-shot-callback usage here.
pub(crate) fn schedule(event_tx: UnboundedSender<SchedulerEvent>, delay: Duration, event: SchedulerEvent) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = event_tx.send(event);
    });
}