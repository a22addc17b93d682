use std::io;
use std::net::SocketAddr;

/// Resolve a DNS name to socket addresses with the given port.
///
/// NAPTR/SRV resolution is out of scope for a next hop selected by the
/// routing layer, names resolve through plain A/AAAA lookups.
pub(crate) async fn resolve_host(
    resolver: &hickory_resolver::TokioResolver,
    name: &str,
    port: u16,
) -> io::Result<Vec<SocketAddr>> {
    let lookup = resolver
        .lookup_ip(name)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;

    let addrs: Vec<SocketAddr> = lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {name}"),
        ));
    }

    Ok(addrs)
}
