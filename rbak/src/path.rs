use anyhow::Context;

/// Parse a command line path into a backup endpoint.
///
/// Paths of the form `[user@]host[:port]:/abs/path` (IPv6 hosts in brackets) refer to a remote
/// host reached over ssh and must be absolute. Anything else is a local path.
pub fn parse_path(path: &str) -> anyhow::Result<common::Endpoint> {
    let re = regex::Regex::new(
        r"^(?:(?P<user>[^@]+)@)?(?P<host>(?:\[[^\]]+\]|[^:\[\]]+))(?::(?P<port>\d+))?:(?P<path>.+)$",
    )
    .context("invalid remote path pattern")?;
    let Some(captures) = re.captures(path) else {
        return Ok(common::Endpoint {
            location: common::Location::Local,
            path: path.to_string(),
        });
    };
    let host = captures
        .name("host")
        .map(|m| m.as_str().to_string())
        .with_context(|| format!("remote path {path:?} has no host"))?;
    let port = match captures.name("port") {
        Some(port) => Some(
            port.as_str()
                .parse::<u16>()
                .with_context(|| format!("invalid port in {path:?}"))?,
        ),
        None => None,
    };
    let remote_path = captures
        .name("path")
        .map(|m| m.as_str())
        .with_context(|| format!("remote path {path:?} has no filesystem path"))?;
    if !remote_path.starts_with('/') {
        return Err(anyhow::anyhow!("Path must be absolute: {}", remote_path));
    }
    Ok(common::Endpoint {
        location: common::Location::Ssh(common::SshTarget {
            host,
            user: captures.name("user").map(|m| m.as_str().to_string()),
            port,
        }),
        path: remote_path.to_string(),
    })
}

/// Reject destinations ending in `.` or `..`, the backup lands in a sub-directory named after
/// the source so the intended target would be ambiguous.
pub fn validate_destination_path(endpoint: &common::Endpoint) -> anyhow::Result<()> {
    let path = endpoint.path.as_str();
    if path == "." || path == ".." || path.ends_with("/.") || path.ends_with("/..") {
        return Err(anyhow::anyhow!(
            "Destination path cannot end with '.' or '..': {:?}\n\
            Use the directory's name instead, e.g. 'rbak ~/photos ../backup'",
            path
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(endpoint: &common::Endpoint) -> &common::SshTarget {
        match &endpoint.location {
            common::Location::Ssh(target) => target,
            common::Location::Local => panic!("Expected remote path"),
        }
    }

    #[test]
    fn test_parse_path_local() -> anyhow::Result<()> {
        let endpoint = parse_path("/path/to/dir")?;
        assert_eq!(endpoint.location, common::Location::Local);
        assert_eq!(endpoint.path, "/path/to/dir");
        let endpoint = parse_path("relative/dir")?;
        assert_eq!(endpoint.location, common::Location::Local);
        Ok(())
    }

    #[test]
    fn test_parse_path_remote_basic() -> anyhow::Result<()> {
        let endpoint = parse_path("host:/path/to/dir")?;
        let target = target(&endpoint);
        assert_eq!(target.user, None);
        assert_eq!(target.host, "host");
        assert_eq!(target.port, None);
        assert_eq!(endpoint.path, "/path/to/dir");
        Ok(())
    }

    #[test]
    fn test_parse_path_remote_full() -> anyhow::Result<()> {
        let endpoint = parse_path("user@host:22:/path/to/dir")?;
        let target = target(&endpoint);
        assert_eq!(target.user, Some("user".to_string()));
        assert_eq!(target.host, "host");
        assert_eq!(target.port, Some(22));
        assert_eq!(endpoint.path, "/path/to/dir");
        Ok(())
    }

    #[test]
    fn test_parse_path_ipv6() -> anyhow::Result<()> {
        let endpoint = parse_path("[::1]:/srv/backup")?;
        assert_eq!(target(&endpoint).host, "[::1]");
        assert_eq!(endpoint.path, "/srv/backup");
        Ok(())
    }

    #[test]
    fn test_parse_path_remote_must_be_absolute() {
        assert!(parse_path("host:relative/dir").is_err());
    }

    #[test]
    fn test_parse_path_port_out_of_range() {
        assert!(parse_path("host:99999:/srv").is_err());
    }

    #[test]
    fn test_validate_destination_path() -> anyhow::Result<()> {
        assert!(validate_destination_path(&parse_path("/srv/backup")?).is_ok());
        assert!(validate_destination_path(&parse_path(".")?).is_err());
        assert!(validate_destination_path(&parse_path("/srv/..")?).is_err());
        assert!(validate_destination_path(&parse_path("host:/srv/.")?).is_err());
        Ok(())
    }
}
