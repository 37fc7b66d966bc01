//! TCP connect helper functions.

use std::net::SocketAddr;

use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::CopilotError;

/// Wrapper over tokio `TcpSocket::connect()` that provides a retrying logic.
/// `retries == 0` means a single attempt. Each attempt is bounded by
/// `attempt_timeout`.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
    attempt_timeout: Duration,
) -> Result<TcpStream, CopilotError> {
    loop {
        let socket = if conn_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;

        let err = match time::timeout(attempt_timeout, socket.connect(conn_addr))
            .await
        {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => CopilotError::from(err),
            Err(_) => CopilotError::msg(format!(
                "connect to '{}' timed out after {} ms",
                conn_addr,
                attempt_timeout.as_millis()
            )),
        };
        if retries == 0 {
            return Err(err);
        }
        retries -= 1;
        time::sleep(Duration::from_secs(1)).await;
    }
}
