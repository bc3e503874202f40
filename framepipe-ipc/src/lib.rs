// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod channel;
pub mod endpoint;
pub mod framing;
pub mod message;
pub mod shm;

pub use channel::{ConnId, DealerChannel, HubEvent, IoContext, PubChannel, RouterChannel, SubChannel};
pub use endpoint::Endpoint;
pub use message::{IpcMessage, MsgType, MsgVal};
pub use shm::SharedBufferManager;
