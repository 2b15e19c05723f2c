// Copyright 2023 The SeamDB Authors.
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

//! Table readiness waiting.

use tokio::sync::watch;

use crate::signal::{Interrupted, Interruptor};

/// Published lifecycle of the table a replica belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableState {
    Creating,
    Ready,
    Deleted,
}

/// Terminal outcome of a readiness wait. Deletion is a distinct outcome,
/// not an error: only interruption fails the wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableReadiness {
    Ready,
    Deleted,
}

/// Pends until the table leaves `Creating`. A publisher that vanishes
/// counts as deletion.
pub async fn wait_for_table_readiness(
    status: &watch::Receiver<TableState>,
    interruptor: &Interruptor,
) -> Result<TableReadiness, Interrupted> {
    let mut status = status.clone();
    let settled = interruptor.run(status.wait_for(|state| *state != TableState::Creating)).await?;
    match settled {
        Err(_) => Ok(TableReadiness::Deleted),
        Ok(state) => match *state {
            TableState::Ready => Ok(TableReadiness::Ready),
            TableState::Deleted => Ok(TableReadiness::Deleted),
            TableState::Creating => unreachable!("settled on creating"),
        },
    }
}
