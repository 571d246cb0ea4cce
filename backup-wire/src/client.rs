//! Control-port client: one request, one response, one connection.

use serde_json::{Map, Value};
use tokio::net::TcpStream;

use crate::error::WireError;
use crate::frame::FrameTransport;
use crate::message::{ControlRequest, ControlResponse};

/// Send one framed request to the control server at `addr` and return its
/// framed response, whatever the status.
pub async fn send_request(
    addr: &str,
    request: &ControlRequest,
) -> Result<ControlResponse, WireError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| WireError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    let mut transport = FrameTransport::new(stream);

    let payload = serde_json::to_string(request)?;
    transport.send_text(&payload).await?;
    let text = transport.receive_text().await?;
    transport.abort();

    let response: ControlResponse = serde_json::from_str(&text)?;
    Ok(response)
}

/// Send `command` with `args` and return `data` of an `OK` response.
pub async fn request(
    addr: &str,
    command: &str,
    args: Map<String, Value>,
) -> Result<Value, WireError> {
    let response = send_request(addr, &ControlRequest::new(command, args)).await?;
    response_into_data(response)
}

fn response_into_data(response: ControlResponse) -> Result<Value, WireError> {
    if response.is_ok() {
        Ok(response.data)
    } else {
        Err(WireError::Rejected {
            message: response.message,
            data: response.data,
        })
    }
}
