use rand::Rng;
use tokio::net::TcpListener;

use crate::error::{MeshError, Result};

/// Find a free TCP port in `[start, end)`.
///
/// Probing begins at a uniformly random point in the range so that
/// co-located instances starting together do not fight over the same
/// low ports, then walks upward one port at a time. There is no
/// wraparound: once the probe passes `end` the allocation fails.
///
/// The probe binds a throwaway listener and releases it immediately, so
/// another process can still grab the port before our real listener
/// binds. The signaling server's own bind is the authoritative check;
/// if it loses that race the caller sees `MeshError::Bind`.
pub async fn allocate_port(start: u16, end: u16) -> Result<u16> {
    let no_port = || MeshError::NoPortAvailable { start, end };
    if start >= end {
        return Err(no_port());
    }

    let first = rand::thread_rng().gen_range(start..end);
    for port in first..end {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                drop(listener);
                tracing::debug!(port, "allocated free port");
                return Ok(port);
            }
            Err(e) => {
                tracing::trace!(port, "port probe failed: {e}");
            }
        }
    }

    Err(no_port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_within_range() {
        let port = allocate_port(17000, 17100).await.unwrap();
        assert!((17000..17100).contains(&port));

        // The returned port is actually bindable right after.
        let listener = TcpListener::bind(("0.0.0.0", port)).await.unwrap();
        drop(listener);
    }

    #[tokio::test]
    async fn fails_when_range_is_exhausted() {
        // Hold the entire (tiny) range so every probe fails.
        let a = TcpListener::bind(("0.0.0.0", 17210)).await.unwrap();
        let b = TcpListener::bind(("0.0.0.0", 17211)).await.unwrap();

        let err = allocate_port(17210, 17212).await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::NoPortAvailable { start: 17210, end: 17212 }
        ));

        drop((a, b));
    }

    #[tokio::test]
    async fn empty_range_is_an_error() {
        assert!(allocate_port(5000, 5000).await.is_err());
    }
}
