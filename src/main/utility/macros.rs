/// Log a warning, and panic in debug builds.
macro_rules! debug_panic {
    ($($x:tt)+) => {
        log::warn!($($x)+);
        #[cfg(debug_assertions)]
        panic!($($x)+);
    };
}

#[cfg(test)]
mod tests {
    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "queue left with 3 callbacks")]
    fn debug_panic_panics_in_debug_builds() {
        debug_panic!("queue left with {} callbacks", 3);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn debug_panic_only_warns_in_release_builds() {
        debug_panic!("queue left with {} callbacks", 3);
    }
}
