//! Logging interface, contingent on the hidden `__log` feature, or the
//! `defmt-03` feature
//!
//! Only enable `__log` when debugging, and when you're certain that your
//! logger isn't going through a USB device behind this controller!

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt-03")]
        ::defmt_03::debug!($($args)*);
        #[cfg(feature = "__log")]
        ::__log::debug!($($args)*);
    };
}

macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt-03")]
        ::defmt_03::trace!($($args)*);
        #[cfg(feature = "__log")]
        ::__log::trace!($($args)*);
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt-03")]
        ::defmt_03::warn!($($args)*);
        #[cfg(feature = "__log")]
        ::__log::warn!($($args)*);
    };
}
