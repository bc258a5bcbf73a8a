use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

pub const AUTHOR: &str = "Rareș Cosma - rares@getbetter.ro";

/// Runtime configuration, parsed once at startup. Every field has a
/// `ZOK_`-style env fallback so the binary runs the same under systemd,
/// a Helm chart, or a developer's shell.
#[derive(Parser, Debug)]
#[clap(about = "Control plane that programs an OVN logical network to realize Kubernetes workload connectivity", author = AUTHOR)]
pub struct Opts {
    /// Comma-separated `{tcp|ssl|unix}:host:port` list of OVN northbound DBs.
    #[clap(long, value_parser, env = "ZOK_OVN_NB_ADDR")]
    pub ovn_nb_address: String,

    #[clap(long, value_parser = parse_duration, env = "ZOK_HEALTH_CHECK_INTERVAL", default_value = "30s")]
    pub health_check_interval: Duration,

    /// 0 means retry forever.
    #[clap(long, env = "ZOK_MAX_RECONNECT_ATTEMPTS", default_value = "0")]
    pub max_reconnect_attempts: u32,

    #[clap(long, value_parser = parse_duration, env = "ZOK_TXN_TIMEOUT", default_value = "30s")]
    pub transaction_timeout: Duration,

    /// Worker count per controller's work queue.
    #[clap(long, env = "ZOK_WORKERS", default_value = "4")]
    pub workers_per_controller: usize,

    #[clap(long, env = "ZOK_METRICS_ADDR", default_value = "0.0.0.0:9091")]
    pub metrics_addr: SocketAddr,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' has no unit, e.g. '30s'"))?;
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().map_err(|_| format!("invalid duration '{s}'"))?;
    match unit {
        "s" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        _ => Err(format!("unknown duration unit '{unit}' in '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parses_milliseconds() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
    }

    #[test]
    fn rejects_missing_unit() {
        assert!(parse_duration("30").is_err());
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("30h").is_err());
    }
}
