use std::cell::RefCell;
use std::fmt::{self, Write};
use std::time::{Duration, SystemTime};

use http::HeaderValue;
use httpdate::HttpDate;

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

// Coarse refresh: one render per ten seconds is plenty for a Date header.
const REFRESH: Duration = Duration::from_secs(10);

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

/// Seeds the cache for this reactor thread.
pub(crate) fn update() {
    CACHED.with(|cache| {
        cache.borrow_mut().check();
    })
}

/// The cached `Date` header value, refreshed when stale.
pub(crate) fn update_and_header_value() -> HeaderValue {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        cache.header_value.clone()
    })
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    pos: usize,
    header_value: HeaderValue,
    next_update: SystemTime,
}

impl CachedDate {
    fn new() -> Self {
        let mut cache = Self {
            bytes: [0; DATE_VALUE_LENGTH],
            pos: 0,
            header_value: HeaderValue::from_static(""),
            next_update: SystemTime::now(),
        };
        cache.update(cache.next_update);
        cache
    }

    fn check(&mut self) {
        let now = SystemTime::now();
        if now > self.next_update {
            self.update(now);
        }
    }

    fn update(&mut self, now: SystemTime) {
        self.render(now);
        self.next_update = now + REFRESH;
    }

    fn render(&mut self, now: SystemTime) {
        self.pos = 0;
        let _ = write!(self, "{}", HttpDate::from(now));
        debug_assert!(self.pos == DATE_VALUE_LENGTH);
        if let Ok(value) = HeaderValue::from_bytes(&self.bytes[..self.pos]) {
            self.header_value = value;
        }
    }
}

impl fmt::Write for CachedDate {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let len = s.len();
        self.bytes[self.pos..self.pos + len].copy_from_slice(s.as_bytes());
        self.pos += len;
        Ok(())
    }
}
