//! Local port probing and public port selection

use std::collections::HashSet;
use std::net::{SocketAddr, TcpStream};
use std::ops::Range;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// True when something accepts TCP connections on 127.0.0.1:`port`
pub fn is_port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}

/// First port in `range` that nobody listens on and that is not `reserved`
pub fn find_available_port(range: Range<u16>, reserved: &HashSet<u16>) -> Option<u16> {
    range
        .filter(|port| *port != 0)
        .find(|port| !reserved.contains(port) && !is_port_in_use(*port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_listening_port_is_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_in_use(port));

        drop(listener);
        assert!(!is_port_in_use(port));
    }

    #[test]
    fn test_skips_reserved_and_busy_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();

        // The busy port is the only candidate
        assert_eq!(find_available_port(busy..busy.saturating_add(1), &HashSet::new()), None);

        let free = TcpListener::bind("127.0.0.1:0").unwrap();
        let free_port = free.local_addr().unwrap().port();
        drop(free);

        let reserved: HashSet<u16> = [free_port].into_iter().collect();
        assert_eq!(find_available_port(free_port..free_port + 1, &reserved), None);
        assert_eq!(
            find_available_port(free_port..free_port + 1, &HashSet::new()),
            Some(free_port)
        );
    }
}
