/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */


// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(missing_debug_implementations,
// TODO: missing_docs,
trivial_casts,
trivial_numeric_casts,
unused_extern_crates,
unused_import_braces,
unused_qualifications,
unused_results
)]
#![warn(clippy::unwrap_used)]
#![allow(unused_qualifications)]

use std::sync::atomic::{AtomicUsize, Ordering};

// Nix has a collection of test helpers that are not exposed publicly by their crate
// The below skip helpers are here: https://github.com/nix-rust/nix/blob/master/test/common/mod.rs

#[macro_export]
macro_rules! skip {
    ($($reason: expr),+) => {
        use ::std::io::{self, Write};

        let stderr = io::stderr();
        let mut handle = stderr.lock();
        writeln!(handle, $($reason),+).unwrap();
        return;
    }
}

#[macro_export]
macro_rules! skip_if_not_root {
    ($name:expr) => {
        use nix::unistd::Uid;

        if !Uid::current().is_root() {
            skip!("{} requires root privileges. Skipping test.", $name);
        }
    };
}

#[macro_export]
macro_rules! skip_if_seccomp {
    ($name:expr) => {
        if let Ok(s) = std::fs::read_to_string("/proc/self/status") {
            for l in s.lines() {
                let mut fields = l.split_whitespace();
                if fields.next() == Some("Seccomp:")
                    && fields.next() != Some("0")
                {
                    skip!(
                        "{} cannot be run in Seccomp mode.  Skipping test.",
                        stringify!($name)
                    );
                }
            }
        }
    };
}

/// Skips the test when the named binary cannot be found on `PATH`.
#[macro_export]
macro_rules! skip_if_missing_binary {
    ($name:expr, $binary:expr) => {
        if !$crate::binary_on_path($binary) {
            skip!("{} requires `{}` on PATH. Skipping test.", $name, $binary);
        }
    };
}

#[macro_export]
macro_rules! assert_eventually_eq {
    ($left: expr, $right: expr $(,)?) => {
        assert_eventually_eq!($left, $right, Duration::from_millis(200), Duration::from_millis(10));
    };
    ($left: expr, $right: expr, $timeout: expr $(,)?) => {
        assert_eventually_eq!($left, $right, $timeout, Duration::from_millis(10));
    };
    ($left: expr, $right: expr, $timeout: expr, $poll_interval: expr $(,)?) => {
        let start = ::std::time::Instant::now();
        let timeout = $timeout;
        let poll_interval = $poll_interval;
        while !($left == $right) {
            ::tokio::time::sleep(poll_interval).await;
            let now = ::std::time::Instant::now();
            if now.duration_since(start) > timeout {
                ::core::panic!("assertion failed: `(left == right)`\nleft: {:#?}\nright: {:#?}", $left, $right);
            }
        }
    };
}

pub fn binary_on_path(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
        })
        .unwrap_or(false)
}

static GUEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Guest names shared by tests in one process must not collide: the
/// job registry and the state directory are keyed by name.
pub fn unique_guest_name(prefix: &str) -> String {
    let n = GUEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}-{}-{n}", std::process::id())
}
