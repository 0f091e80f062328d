pub mod bitset;
pub mod freelist;

/// Single funnel for logic errors. Programmer errors (duplicate components,
/// page alignment violations, pool mismatches, graph misuse) are fatal: the
/// message is logged with its call site and the process unwinds into the
/// panic hook.
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    let location = std::panic::Location::caller();
    log::error!("fatal error at {}: {}", location, msg);
    panic!("{}", msg);
}

macro_rules! fatal_macro {
    ($($arg:tt)*) => {
        $crate::common::fatal(&format!($($arg)*))
    };
}

pub(crate) use fatal_macro as fatal;
