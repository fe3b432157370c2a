//! Bootstrap: uniform channel identity across hosts.
//!
//! A child must be able to look up "the endpoint for channel `k`" for
//! `k ∈ {3, 4, 5}` deterministically on every host.
//!
//! **POSIX**: logical index equals descriptor number. Channels 0–2 are
//! the conventional three; 3–5 are descriptors 3, 4, 5 after the
//! child-side redirection. No further protocol is needed.
//!
//! **Windows** (or any host whose handles are opaque): the parent
//! publishes a [`HandleMap`] — channels 0–2 travel in startup-info,
//! channels 3–5 as `<idx>:<hex>` pairs in the `HEXSH_FD_MAP`
//! environment variable, with a `--hexsh-fd-map=` command-line flag as
//! fallback for environments that strip variables. The launcher also
//! whitelists exactly the six endpoints for inheritance; the protocol
//! never relies on implicit ordering of inherited handles.
//!
//! Child-side retrieval validates every handle against a live kernel
//! object; invalid entries are treated as "channel absent".

use hexsh_types::{Channel, HandleMap};

/// Environment variable conveying the channel 3–5 handle map.
pub const HANDLE_MAP_ENV: &str = "HEXSH_FD_MAP";

/// Command-line fallback: `--hexsh-fd-map=<payload>`.
pub const HANDLE_MAP_FLAG: &str = "--hexsh-fd-map";

/// How the parent delivers the handle map to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapDelivery {
    /// `HEXSH_FD_MAP` in the child environment (default).
    #[default]
    Env,
    /// Appended `--hexsh-fd-map=<payload>` argument.
    CommandLine,
}

/// Read the handle map the parent published for this process.
///
/// Checks the environment variable first, then scans the command line
/// for the flag. Returns an empty map when neither is present — on
/// POSIX that is the normal case, since descriptor numbers carry the
/// identity already.
pub fn retrieve_handle_map() -> HandleMap {
    let map = map_from_env();
    if !map.is_empty() {
        return map;
    }
    map_from_args(std::env::args())
}

/// Parse the map out of `HEXSH_FD_MAP`, if set.
pub fn map_from_env() -> HandleMap {
    match std::env::var(HANDLE_MAP_ENV) {
        Ok(payload) => HandleMap::parse(&payload),
        Err(_) => HandleMap::new(),
    }
}

/// Scan an argument list for `--hexsh-fd-map=<payload>`.
pub fn map_from_args(args: impl IntoIterator<Item = String>) -> HandleMap {
    for arg in args {
        if let Some(payload) = arg.strip_prefix(HANDLE_MAP_FLAG) {
            if let Some(payload) = payload.strip_prefix('=') {
                return HandleMap::parse(payload);
            }
        }
    }
    HandleMap::new()
}

/// Drop every entry that does not name a live kernel object.
///
/// A stale or forged handle value must read as "channel absent", never
/// as a usable endpoint.
pub fn validate_handle_map(mut map: HandleMap) -> HandleMap {
    for channel in [Channel::Telemetry, Channel::DataIn, Channel::DataOut] {
        if let Some(raw) = map.get(channel) {
            if !handle_is_live(raw) {
                tracing::debug!(channel = %channel, raw, "discarding dead handle-map entry");
                map.remove(channel);
            }
        }
    }
    map
}

/// Retrieve and validate in one step; the usual child-side entry point.
pub fn retrieve_validated_handle_map() -> HandleMap {
    validate_handle_map(retrieve_handle_map())
}

#[cfg(unix)]
fn handle_is_live(raw: u64) -> bool {
    let Ok(fd) = i32::try_from(raw) else {
        return false;
    };
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_ok()
}

#[cfg(windows)]
fn handle_is_live(raw: u64) -> bool {
    use winapi::um::handleapi::{GetHandleInformation, INVALID_HANDLE_VALUE};
    use winapi::um::winnt::HANDLE;

    let handle = raw as usize as HANDLE;
    if handle.is_null() || handle == INVALID_HANDLE_VALUE {
        return false;
    }
    let mut flags: u32 = 0;
    unsafe { GetHandleInformation(handle, &mut flags) != 0 }
}

/// Build the environment pair (`HEXSH_FD_MAP`, payload) for a child,
/// or `None` when the map is empty.
pub fn env_entry(map: &HandleMap) -> Option<(String, String)> {
    if map.is_empty() {
        None
    } else {
        Some((HANDLE_MAP_ENV.to_string(), map.serialize()))
    }
}

/// Build the command-line fallback argument, or `None` when empty.
pub fn flag_entry(map: &HandleMap) -> Option<String> {
    if map.is_empty() {
        None
    } else {
        Some(format!("{}={}", HANDLE_MAP_FLAG, map.serialize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing_finds_the_payload() {
        let args = vec![
            "child".to_string(),
            "--verbose".to_string(),
            "--hexsh-fd-map=3:0x1A4;5:0x2C0".to_string(),
        ];
        let map = map_from_args(args);
        assert_eq!(map.get(Channel::Telemetry), Some(0x1A4));
        assert_eq!(map.get(Channel::DataIn), None);
        assert_eq!(map.get(Channel::DataOut), Some(0x2C0));
    }

    #[test]
    fn bare_flag_without_value_is_ignored() {
        let map = map_from_args(vec!["--hexsh-fd-map".to_string()]);
        assert!(map.is_empty());
    }

    #[test]
    fn env_and_flag_entries_round_trip() {
        let mut map = HandleMap::new();
        map.insert(Channel::DataIn, 0xB00);

        let (key, value) = env_entry(&map).unwrap();
        assert_eq!(key, HANDLE_MAP_ENV);
        assert_eq!(HandleMap::parse(&value), map);

        let flag = flag_entry(&map).unwrap();
        let parsed = map_from_args(vec![flag]);
        assert_eq!(parsed, map);
    }

    #[test]
    fn empty_map_produces_no_delivery() {
        let map = HandleMap::new();
        assert!(env_entry(&map).is_none());
        assert!(flag_entry(&map).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn validation_keeps_live_descriptors_and_drops_dead_ones() {
        use std::os::fd::AsRawFd;

        let (read, _write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();

        let mut map = HandleMap::new();
        map.insert(Channel::Telemetry, read.as_raw_fd() as u64);
        map.insert(Channel::DataOut, 0xFFFF_FFF0); // certainly not open

        let validated = validate_handle_map(map);
        assert_eq!(
            validated.get(Channel::Telemetry),
            Some(read.as_raw_fd() as u64)
        );
        assert_eq!(validated.get(Channel::DataOut), None);
    }
}
