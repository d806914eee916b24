//! Thread pool configuration read from `<pool>.<Key>` properties.
//!
//! Loading the properties themselves (from a file, the environment, ...) is
//! left to the application; anything implementing [`PropertySource`] can be
//! used.

use std::{
    collections::{BTreeMap, HashMap},
    hash::BuildHasher,
    str::FromStr,
    time::Duration,
};

use crate::{
    error::{Error, Result},
    pool::core_count,
};

/// Default idle wait of a worker when `WaitIfNoTask` is enabled.
pub(crate) const DEFAULT_IDLE_TIME: Duration = Duration::from_millis(6000);

/// Default interval between idle-thread shrink passes.
pub(crate) const DEFAULT_SHRINK_CYCLE: Duration = Duration::from_secs(60);

/// A read-only set of string properties.
pub trait PropertySource {
    /// Look up the raw value of `key`.
    fn property(&self, key: &str) -> Option<&str>;
}

impl<S: BuildHasher> PropertySource for HashMap<String, String, S> {
    fn property(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl PropertySource for BTreeMap<String, String> {
    fn property(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

/// Validated settings of a single thread pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Pool name, used as the property prefix and in log messages.
    pub name: String,

    /// Number of workers created up front.
    pub size: usize,

    /// Upper bound on the number of workers.
    pub size_max: usize,

    /// Number of busy workers at which a "running low on threads" warning is
    /// logged.
    pub size_warn: Option<usize>,

    /// Worker stack size, `None` for the platform default.
    pub stack_size: Option<usize>,

    /// Block idle workers on the queue instead of polling and yielding.
    pub wait_if_no_task: bool,

    /// How long an idle worker blocks on the queue before checking for
    /// shutdown.
    pub thread_idle_time: Duration,

    /// Run a background shrinker that retires idle workers.
    pub shrink_if_no_task: bool,

    /// Interval between shrink passes.
    pub shrink_cycle_time: Duration,

    /// Scheduling priority applied to each worker thread.
    pub thread_priority: Option<i32>,
}

impl PoolConfig {
    /// Read the configuration of the pool called `name` from `properties`.
    ///
    /// Recognized keys are `<name>.Size`, `SizeMax` (`-1` for one thread per
    /// CPU core), `SizeWarn`, `StackSize`, `WaitIfNoTask`, `ThreadIdleTime`
    /// (milliseconds), `ShrinkIfNoTask`, `ShrinkCycleTime` (seconds) and
    /// `ThreadPriority`, which falls back to a global `ThreadPriority`.
    /// Out-of-range values are adjusted with a warning; unparsable ones are an
    /// error.
    pub fn from_properties<P>(name: &str, properties: &P) -> Result<Self>
    where
        P: PropertySource + ?Sized,
    {
        let reader = Reader { name, properties };

        let mut size = reader.number::<i64>("Size")?.unwrap_or(1);
        if size < 1 {
            tracing::warn!("{}.Size < 1; Size adjusted to 1", name);
            size = 1;
        }

        let mut size_max = reader.number::<i64>("SizeMax")?.unwrap_or(size);
        if size_max == -1 {
            size_max = core_count() as i64;
        }
        if size_max < size {
            tracing::warn!(
                "{0}.SizeMax < {0}.Size; SizeMax adjusted to Size ({1})",
                name,
                size
            );
            size_max = size;
        }

        let size_warn = match reader.number::<i64>("SizeWarn")? {
            None | Some(0) => None,
            Some(warn) if warn < size => {
                tracing::warn!(
                    "{0}.SizeWarn < {0}.Size; adjusted SizeWarn to Size ({1})",
                    name,
                    size
                );
                Some(size)
            }
            Some(warn) if warn > size_max => {
                tracing::warn!(
                    "{0}.SizeWarn > {0}.SizeMax; adjusted SizeWarn to SizeMax ({1})",
                    name,
                    size_max
                );
                Some(size_max)
            }
            Some(warn) => Some(warn),
        };

        let stack_size = match reader.number::<i64>("StackSize")? {
            Some(stack) if stack < 0 => {
                tracing::warn!("{}.StackSize < 0; Size adjusted to OS default", name);
                None
            }
            Some(0) | None => None,
            Some(stack) => Some(stack as usize),
        };

        let wait_if_no_task = reader.flag("WaitIfNoTask")?.unwrap_or(false);
        let thread_idle_time = if wait_if_no_task {
            match reader.number::<i64>("ThreadIdleTime")? {
                Some(ms) if ms < 0 => {
                    tracing::warn!(
                        "{}.ThreadIdleTime < 0; ThreadIdleTime adjusted to 0 milliseconds",
                        name
                    );
                    Duration::ZERO
                }
                Some(ms) => Duration::from_millis(ms as u64),
                None => DEFAULT_IDLE_TIME,
            }
        } else {
            Duration::ZERO
        };

        let shrink_if_no_task = reader.flag("ShrinkIfNoTask")?.unwrap_or(false);
        let shrink_cycle_time = match reader.number::<i64>("ShrinkCycleTime")? {
            Some(secs) if secs <= 0 => {
                tracing::warn!(
                    "{}.ShrinkCycleTime <= 0; ShrinkCycleTime adjusted to {} seconds",
                    name,
                    DEFAULT_SHRINK_CYCLE.as_secs()
                );
                DEFAULT_SHRINK_CYCLE
            }
            Some(secs) => Duration::from_secs(secs as u64),
            None => DEFAULT_SHRINK_CYCLE,
        };

        let thread_priority = match reader.number::<i32>("ThreadPriority")? {
            Some(priority) => Some(priority),
            None => parse(properties, "ThreadPriority")?,
        };

        Ok(Self {
            name: name.to_owned(),
            size: size as usize,
            size_max: size_max as usize,
            size_warn: size_warn.map(|warn| warn as usize),
            stack_size,
            wait_if_no_task,
            thread_idle_time,
            shrink_if_no_task,
            shrink_cycle_time,
            thread_priority,
        })
    }
}

struct Reader<'a, P: ?Sized> {
    name: &'a str,
    properties: &'a P,
}

impl<P: PropertySource + ?Sized> Reader<'_, P> {
    fn key(&self, suffix: &str) -> String {
        format!("{}.{}", self.name, suffix)
    }

    fn number<T: FromStr>(&self, suffix: &str) -> Result<Option<T>> {
        parse(self.properties, &self.key(suffix))
    }

    fn flag(&self, suffix: &str) -> Result<Option<bool>> {
        let key = self.key(suffix);

        match self.properties.property(&key).map(str::trim) {
            None => Ok(None),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" | "" => Ok(Some(false)),
                _ => Err(Error::InvalidConfig {
                    key,
                    value: value.to_owned(),
                }),
            },
        }
    }
}

fn parse<T, P>(properties: &P, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    P: PropertySource + ?Sized,
{
    match properties.property(key).map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| Error::InvalidConfig {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}
