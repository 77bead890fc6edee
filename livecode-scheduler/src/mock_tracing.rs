// Stand-ins for the `tracing` event macros when the `tracing` feature is
// disabled. Arguments are swallowed without being evaluated.

macro_rules! mock_event_macros {
    ($dollar:tt $($name:ident),+) => {
        $(
            #[allow(unused_macros)]
            macro_rules! $name {
                ($dollar($dollar arg:tt)*) => {};
            }
        )+
    };
}

mock_event_macros!($ error, warn, info, debug, trace);
