use log::debug;

/// Subcommand tag carried as the last character of a `SetProfilerParams`
/// body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerCommand {
    SetConfig = 0,
    State = 1,
    Pause = 2,
    Dump = 3,
}

impl ProfilerCommand {
    /// # Panics
    /// If `digit` is not a known subcommand tag.
    pub fn from_digit(digit: u32) -> Self {
        match digit {
            0 => ProfilerCommand::SetConfig,
            1 => ProfilerCommand::State,
            2 => ProfilerCommand::Pause,
            3 => ProfilerCommand::Dump,
            other => panic!("unknown profiler subcommand {other}"),
        }
    }
}

/// The profiler collaborator the server forwards worker commands to.
pub trait Profiler {
    fn set_config(&self, keys: Vec<String>, vals: Vec<String>);
    fn set_state(&self, state: i32);
    fn pause(&self, paused: i32);
    fn dump(&self, finished: i32);
}

/// Default profiler: logs and drops everything.
#[derive(Debug, Default)]
pub struct NullProfiler;

impl Profiler for NullProfiler {
    fn set_config(&self, keys: Vec<String>, _vals: Vec<String>) {
        debug!(params = keys.len(); "profiler config ignored");
    }

    fn set_state(&self, _state: i32) {}

    fn pause(&self, _paused: i32) {}

    fn dump(&self, _finished: i32) {}
}

/// Parses a `k1:v1,k2:v2,...` profiler config into key and value arrays,
/// prefixing a `filename` value with the local rank so servers sharing a
/// working directory don't clobber each other's output.
///
/// # Panics
/// If any element is not a `key:value` pair with both sides non-empty.
pub fn parse_profiler_config(params: &str, rank: usize) -> (Vec<String>, Vec<String>) {
    let mut keys = Vec::new();
    let mut vals = Vec::new();

    // The wire format ends in ",<tag>"; stripping the tag leaves a
    // trailing separator.
    let params = params.strip_suffix(',').unwrap_or(params);
    for elem in params.split(',') {
        let parts: Vec<&str> = elem.split(':').collect();
        assert_eq!(parts.len(), 2, "improper profiler config passed from worker");
        let (key, val) = (parts[0], parts[1]);
        assert!(!key.is_empty(), "profiler config parameter is empty");
        assert!(
            !val.is_empty(),
            "profiler config value is empty for parameter {key}"
        );

        let val = if key == "filename" {
            format!("rank{rank}_{val}")
        } else {
            val.to_string()
        };

        keys.push(key.to_string());
        vals.push(val);
    }

    (keys, vals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_pairs() {
        let (keys, vals) = parse_profiler_config("profile_all:1,aggregate_stats:1", 0);
        assert_eq!(keys, ["profile_all", "aggregate_stats"]);
        assert_eq!(vals, ["1", "1"]);
    }

    #[test]
    fn test_trailing_separator_is_dropped() {
        let (keys, vals) = parse_profiler_config("profile_all:1,", 0);
        assert_eq!(keys, ["profile_all"]);
        assert_eq!(vals, ["1"]);
    }

    #[test]
    fn test_filename_gets_rank_prefix() {
        let (keys, vals) = parse_profiler_config("filename:server_profile.json", 3);
        assert_eq!(keys, ["filename"]);
        assert_eq!(vals, ["rank3_server_profile.json"]);
    }

    #[test]
    #[should_panic(expected = "improper profiler config")]
    fn test_extra_colon_is_fatal() {
        parse_profiler_config("filename:a:b", 1);
    }

    #[test]
    #[should_panic(expected = "improper profiler config")]
    fn test_missing_value_is_fatal() {
        parse_profiler_config("profile_all", 0);
    }

    #[test]
    #[should_panic(expected = "profiler config parameter is empty")]
    fn test_missing_key_is_fatal() {
        parse_profiler_config(":1", 0);
    }

    #[test]
    #[should_panic(expected = "unknown profiler subcommand")]
    fn test_unknown_subcommand_is_fatal() {
        ProfilerCommand::from_digit(9);
    }
}
