/// Identifier this process writes into the locks it holds.
///
/// Prefers `MODCACHE_NODE_ID` (e.g. set from a pod name).  Falls back to
/// `<hostname>-<random-8-chars>` so two processes on one host never share an
/// id.
pub fn node_id() -> String {
    std::env::var("MODCACHE_NODE_ID").unwrap_or_else(|_| {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        format!("{hostname}-{suffix}")
    })
}

/// Identifier for this process's in-flight job list.
///
/// Unlike [`node_id`] it must survive a restart so unacknowledged jobs can be
/// recovered: `MODCACHE_NODE_ID` if set, otherwise the hostname.
pub fn consumer_id() -> String {
    std::env::var("MODCACHE_NODE_ID")
        .unwrap_or_else(|_| gethostname::gethostname().to_string_lossy().into_owned())
}
