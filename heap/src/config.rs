use log::warn;
use object::{MIN_NURSERY_OBJECT_SIZE, WORD};

use crate::{arena::PAGE_HEADER_SIZE, error::GcError};

pub const ENV_NURSERY: &str = "MINIMARK_NURSERY";
pub const ENV_MAJOR_COLLECT: &str = "MINIMARK_MAJOR_COLLECT";
pub const ENV_MAX: &str = "MINIMARK_MAX";

/// Configuration of the collector. Read once when the collector is built.
#[derive(Debug, Clone)]
pub struct GcSettings {
    /// Size of the nursery in bytes. Must be a multiple of the word size.
    pub nursery_size: usize,
    /// A major collection starts when the memory outside the nursery grows
    /// past `major_collection_threshold` times what survived the last one.
    pub major_collection_threshold: f64,
    /// Largest request, header included, served by the nursery and the
    /// arenas. Bigger objects go to the system allocator.
    pub small_request_threshold: usize,
    /// Size of an arena page. Each page serves a single size class.
    pub page_size: usize,
    /// Size of an arena, the unit of memory requested from the OS.
    pub arena_size: usize,
    /// Upper bound for memory outside the nursery, 0 for no limit.
    pub max_heap_size: usize,
    /// Array items covered by one card marker bit of a large array, 0 to
    /// disable card marking. Must be a power of two.
    pub card_page_indices: usize,
    /// Check the header invariants after every collection.
    pub debug_checks: bool,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            nursery_size: 896 * 1024,               // 896 KB
            major_collection_threshold: 1.82,       // grow by 82%
            small_request_threshold: 256 - WORD,    // 248 bytes on 64 bit
            page_size: 4096,                        // 4 KB
            arena_size: 65536 * WORD,               // 512 KB on 64 bit
            max_heap_size: 0,                       // unlimited
            card_page_indices: 128,
            debug_checks: cfg!(debug_assertions),
        }
    }
}

impl GcSettings {
    /// Default settings with the `MINIMARK_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides found through `lookup`. Bad values are ignored.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        if let Some(text) = lookup(ENV_NURSERY) {
            match parse_size(&text) {
                // keep room for a reasonable number of small objects
                Some(size) => {
                    let minimum = 18 * self.small_request_threshold;
                    self.nursery_size = round_down_to_word(size.max(minimum));
                }
                None => warn!(target: "gc", "ignoring {ENV_NURSERY}={text:?}"),
            }
        }
        if let Some(text) = lookup(ENV_MAJOR_COLLECT) {
            match text.trim().parse::<f64>() {
                Ok(factor) if factor >= 1.0 => {
                    self.major_collection_threshold = factor;
                }
                _ => warn!(target: "gc", "ignoring {ENV_MAJOR_COLLECT}={text:?}"),
            }
        }
        if let Some(text) = lookup(ENV_MAX) {
            match parse_size(&text) {
                Some(size) => self.max_heap_size = size,
                None => warn!(target: "gc", "ignoring {ENV_MAX}={text:?}"),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), GcError> {
        let invalid = |reason: &'static str| -> Result<(), GcError> {
            Err(GcError::InvalidSettings(reason))
        };
        if self.nursery_size == 0
            || self.page_size == 0
            || self.arena_size == 0
            || self.small_request_threshold == 0
        {
            return invalid("sizes must be > 0");
        }
        if !self.nursery_size.is_multiple_of(WORD)
            || !self.page_size.is_multiple_of(WORD)
            || !self.small_request_threshold.is_multiple_of(WORD)
        {
            return invalid("sizes must be multiples of the word size");
        }
        if self.small_request_threshold < MIN_NURSERY_OBJECT_SIZE {
            return invalid("small_request_threshold is below the minimum object size");
        }
        if self.page_size < PAGE_HEADER_SIZE + self.small_request_threshold {
            return invalid("page_size cannot hold a block of small_request_threshold");
        }
        if self.arena_size < 2 * self.page_size {
            return invalid("arena_size must hold at least two pages");
        }
        if self.nursery_size < self.small_request_threshold {
            return invalid("nursery_size must hold a small request");
        }
        if self.card_page_indices != 0 && !self.card_page_indices.is_power_of_two() {
            return invalid("card_page_indices must be 0 or a power of two");
        }
        if !(self.major_collection_threshold >= 1.0) {
            return invalid("major_collection_threshold must be >= 1.0");
        }
        Ok(())
    }
}

#[inline]
fn round_down_to_word(size: usize) -> usize {
    size & !(WORD - 1)
}

/// Parses a byte count such as `4096`, `512KB` or `1GB`.
pub fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let upper = text.to_ascii_uppercase();
    let (digits, factor) = [
        ("GB", 1 << 30),
        ("MB", 1 << 20),
        ("KB", 1 << 10),
        ("G", 1 << 30),
        ("M", 1 << 20),
        ("K", 1 << 10),
        ("B", 1),
    ]
    .iter()
    .find_map(|&(suffix, factor)| {
        upper.strip_suffix(suffix).map(|digits| (digits, factor))
    })
    .unwrap_or((upper.as_str(), 1));
    digits.trim().parse::<usize>().ok()?.checked_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(
        pairs: &'a [(&'a str, &'a str)],
    ) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_default_settings_are_valid() {
        GcSettings::default().validate().expect("defaults must validate");
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let cases = [
            GcSettings { nursery_size: 0, ..Default::default() },
            GcSettings { page_size: 4095, ..Default::default() },
            GcSettings { small_request_threshold: WORD, ..Default::default() },
            GcSettings { page_size: 256, ..Default::default() },
            GcSettings { arena_size: 4096, ..Default::default() },
            GcSettings { nursery_size: 64, ..Default::default() },
            GcSettings { major_collection_threshold: 0.5, ..Default::default() },
            GcSettings { major_collection_threshold: f64::NAN, ..Default::default() },
            GcSettings { card_page_indices: 12, ..Default::default() },
        ];
        for settings in cases {
            assert!(
                matches!(settings.validate(), Err(GcError::InvalidSettings(_))),
                "{settings:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_card_marking_can_be_disabled() {
        let settings = GcSettings { card_page_indices: 0, ..Default::default() };
        settings.validate().expect("card marking is optional");
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("512KB"), Some(512 * 1024));
        assert_eq!(parse_size("3mb"), Some(3 << 20));
        assert_eq!(parse_size(" 1G "), Some(1 << 30));
        assert_eq!(parse_size("12B"), Some(12));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_env_overrides() {
        let settings = GcSettings::default().with_overrides(lookup(&[
            (ENV_NURSERY, "4MB"),
            (ENV_MAJOR_COLLECT, "2.5"),
            (ENV_MAX, "1GB"),
        ]));
        assert_eq!(settings.nursery_size, 4 << 20);
        assert_eq!(settings.major_collection_threshold, 2.5);
        assert_eq!(settings.max_heap_size, 1 << 30);
        settings.validate().expect("overridden settings must validate");
    }

    #[test]
    fn test_env_overrides_ignore_bad_values() {
        let defaults = GcSettings::default();
        let settings = GcSettings::default().with_overrides(lookup(&[
            (ENV_NURSERY, "huge"),
            (ENV_MAJOR_COLLECT, "0.9"),
            (ENV_MAX, "-1"),
        ]));
        assert_eq!(settings.nursery_size, defaults.nursery_size);
        assert_eq!(
            settings.major_collection_threshold,
            defaults.major_collection_threshold
        );
        assert_eq!(settings.max_heap_size, 0);
    }

    #[test]
    fn test_tiny_nursery_override_is_clamped() {
        let settings = GcSettings::default()
            .with_overrides(lookup(&[(ENV_NURSERY, "100")]));
        assert_eq!(settings.nursery_size, 18 * settings.small_request_threshold);
    }
}
