// Copyright 2026 Daniel Pelikan
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

//! Bluetooth communication module.
//!
//! RFCOMM client transport, the receive loop and the text protocol codec.

mod codec;
mod receiver;
mod rfcomm;
mod transport;

pub use codec::{
    decode_response, encode_request, format_wire_bytes, to_wire_bytes, Frame, ParseError,
    REQUEST_TEXT,
};
pub use receiver::{ReceiveLoop, DEFAULT_BUFFER_SIZE};
pub use rfcomm::{RfcommTransport, SPP_UUID};
pub use transport::{DeviceRef, SplitHandle, StreamHandle, Transport, TransportError};
