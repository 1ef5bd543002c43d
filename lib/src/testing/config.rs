use crate::klog::KlogLevel;

const DEFAULT_ENABLED: bool = false;
const DEFAULT_VERBOSITY: Verbosity = Verbosity::Summary;
const DEFAULT_TIMEOUT_MS: u32 = 0;
const DEFAULT_DESTRUCTIVE: bool = false;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Summary,
    Verbose,
}

impl Verbosity {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("quiet") {
            Verbosity::Quiet
        } else if value.eq_ignore_ascii_case("verbose") {
            Verbosity::Verbose
        } else {
            Verbosity::Summary
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "quiet",
            Verbosity::Summary => "summary",
            Verbosity::Verbose => "verbose",
        }
    }
}

impl core::fmt::Display for Verbosity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestConfig {
    pub enabled: bool,
    pub verbosity: Verbosity,
    pub timeout_ms: u32,
    /// Allow suites that execute INVD. Off unless asked for: INVD drops the
    /// dirty lines of the whole processor, not only the test buffer.
    pub destructive: bool,
    /// Log level to apply for the duration of the run.
    pub klog_level: Option<KlogLevel>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_ENABLED,
            verbosity: DEFAULT_VERBOSITY,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            destructive: DEFAULT_DESTRUCTIVE,
            klog_level: None,
        }
    }
}

impl TestConfig {
    /// Recover the config from the untyped pointer handed to suite runners.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a live `TestConfig`.
    pub unsafe fn from_runner_arg<'a>(ptr: *const ()) -> Option<&'a TestConfig> {
        unsafe { (ptr as *const TestConfig).as_ref() }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("enabled")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value.eq_ignore_ascii_case("disabled")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

pub fn config_from_cmdline(cmdline: Option<&str>) -> TestConfig {
    let mut cfg = TestConfig::default();
    if let Some(cmdline) = cmdline {
        for token in cmdline.split_whitespace() {
            if let Some(value) = token.strip_prefix("itests=") {
                // Any non-boolean value (e.g. "cache") just enables tests.
                cfg.enabled = parse_bool(value).unwrap_or(true);
            } else if let Some(value) = token.strip_prefix("itests.verbosity=") {
                cfg.verbosity = Verbosity::parse(value);
            } else if let Some(value) = token.strip_prefix("itests.timeout=") {
                if let Ok(parsed) = value.trim_end_matches("ms").parse::<u32>() {
                    cfg.timeout_ms = parsed;
                }
            } else if let Some(value) = token.strip_prefix("itests.destructive=") {
                if let Some(destructive) = parse_bool(value) {
                    cfg.destructive = destructive;
                }
            } else if let Some(value) = token.strip_prefix("klog=") {
                if let Some(level) = KlogLevel::parse(value) {
                    cfg.klog_level = Some(level);
                }
            }
        }
    }
    cfg
}
