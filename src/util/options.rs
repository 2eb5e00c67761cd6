use crate::util::constants::INITIAL_HANDLE_TABLE_ARRAY_SIZE;
use std::default::Default;
use strum_macros::EnumString;

/// How handle tables are sharded across heaps.
#[derive(Copy, Clone, EnumString, Debug, PartialEq, Eq)]
pub enum GCMode {
    /// One table per bucket. Every thread allocates from table 0.
    Workstation,
    /// One table per heap. Threads allocate from their home heap's table,
    /// and each GC thread scans the tables of its own heap.
    Server,
}

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        #[derive(Clone, Debug)]
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            /// Set an option from its snake case name. Returns false and keeps
            /// the current value if the value cannot be parsed or is invalid.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_from_str()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}", s);
                        false
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with GCHANDLES_ and match any option (such as GCHANDLES_HEAP_COUNT),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                const PREFIX: &str = "GCHANDLES_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    // Workstation or server sharding of handle tables.
    gc_mode:               GCMode               [always_valid] = GCMode::Workstation,
    // Number of tables in a bucket in server mode. Ignored in workstation mode.
    heap_count:            usize                [|v: &usize| *v > 0 && *v <= u8::MAX as usize] = num_cpus::get().min(u8::MAX as usize),
    // Number of slots in each node of the handle table map.
    initial_map_size:      usize                [|v: &usize| *v > 0] = INITIAL_HANDLE_TABLE_ARRAY_SIZE,
    // Check the age map of every table after the collector ages handles.
    verify_handle_tables:  bool                 [always_valid] = cfg!(feature = "extreme_assertions"),
}

impl Options {
    /// Number of tables each bucket holds.
    pub fn tables_per_bucket(&self) -> usize {
        match self.gc_mode {
            GCMode::Workstation => 1,
            GCMode::Server => self.heap_count,
        }
    }

    /// Set an option from its camel case name, e.g. `heapCount`.
    pub fn set_from_camelcase_str(&mut self, s: &str, val: &str) -> bool {
        trace!("Trying to process option pair: ({}, {})", s, val);

        let mut sr = String::with_capacity(s.len());
        for c in s.chars() {
            if c.is_uppercase() {
                sr.push('_');
                for c in c.to_lowercase() {
                    sr.push(c);
                }
            } else {
                sr.push(c)
            }
        }

        let result = self.set_from_str(sr.as_str(), val);

        if result {
            trace!("Validation passed");
        } else {
            trace!("Validation failed")
        }
        result
    }
}
