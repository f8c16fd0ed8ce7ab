// SPDX-License-Identifier: GPL-2.0
//
// Counter lifecycle: open a counter or counter group on a target, start and
// stop it, and decode the kernel's grouped read format into scaled values.

use std::fs;
use std::io;
use std::os::unix::io::RawFd;

use anyhow::{anyhow, bail, Result};
use plain::Plain;

use crate::events::EventAttr;
use crate::sys::{self, PerfEventAttr};

/// What a [`Counter`] measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The calling thread, on any CPU. The thread is bound to the counter
    /// for its lifetime.
    ThisThread,
}

impl Target {
    fn pid_cpu(self) -> (libc::pid_t, libc::c_int) {
        match self {
            Target::ThisThread => (0, -1),
        }
    }

    // Acquire/release the execution context the counter is bound to. For
    // ThisThread there is nothing to do: a thread already is an OS thread.
    // Close must release exactly once on every exit path.
    fn bind(self) {}
    fn unbind(self) {}
}

// Leading fixed part of the PERF_FORMAT_GROUP read layout:
// [nr][time_enabled][time_running], then nr values.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct GroupReadHeader {
    nr: u64,
    time_enabled: u64,
    time_running: u64,
}

unsafe impl Plain for GroupReadHeader {}

const GROUP_READ_HEADER_SIZE: usize = std::mem::size_of::<GroupReadHeader>();

/// An open kernel counter for one event or one event group.
///
/// A group is scheduled onto the hardware as a unit, so its members are
/// always counted over the same time windows. A Counter must not be used
/// from more than one thread at a time.
pub struct Counter {
    target: Target,
    bound: bool,
    // Group leader first. Non-leader descriptors exist to keep the kernel
    // events alive; all control and reads go through the leader.
    fds: Vec<RawFd>,
    scales: Vec<(f64, String)>,
    running: bool,
    read_buf: Vec<u8>,
}

impl Counter {
    /// Opens a counter for the given events on `target`. The first event is
    /// the group leader. The counter starts out stopped; call
    /// [`start`](Counter::start).
    pub fn open(target: Target, events: &[EventAttr]) -> Result<Counter> {
        if events.is_empty() {
            bail!("no events given");
        }
        let (pid, cpu) = target.pid_cpu();

        target.bind();
        // From here on c owns the binding and any opened descriptors, so an
        // early error return cleans up through Drop.
        let mut c = Counter {
            target,
            bound: true,
            fds: Vec::with_capacity(events.len()),
            scales: events.iter().map(|e| (e.scale, e.unit.clone())).collect(),
            running: false,
            read_buf: vec![0u8; GROUP_READ_HEADER_SIZE + events.len() * 8],
        };

        // Open the group leader. It carries the read format for the whole
        // group.
        let mut attr = PerfEventAttr::default();
        events[0].fill_attr(&mut attr);
        attr.read_format = sys::PERF_FORMAT_TOTAL_TIME_ENABLED
            | sys::PERF_FORMAT_TOTAL_TIME_RUNNING
            | sys::PERF_FORMAT_GROUP;
        attr.flags |= sys::PERF_ATTR_BIT_DISABLED;

        let leader = sys::perf_event_open(&attr, pid, cpu, -1, sys::PERF_FLAG_FD_CLOEXEC)
            .map_err(permission_hint)?;
        c.fds.push(leader);

        // Open the other group members against the leader.
        for event in &events[1..] {
            let mut attr = PerfEventAttr::default();
            event.fill_attr(&mut attr);
            attr.flags |= sys::PERF_ATTR_BIT_DISABLED;
            let fd = sys::perf_event_open(&attr, pid, cpu, leader, sys::PERF_FLAG_FD_CLOEXEC)
                .map_err(|e| anyhow!("opening {}: {}", event, e))?;
            c.fds.push(fd);
        }

        Ok(c)
    }

    /// Start counting. Starting a running or closed counter is a no-op.
    pub fn start(&mut self) {
        if self.running || self.fds.is_empty() {
            return;
        }
        self.running = true;
        unsafe { libc::ioctl(self.fds[0], sys::PERF_EVENT_IOC_ENABLE as _, 0) };
    }

    /// Stop counting. Stopping a stopped or closed counter is a no-op.
    pub fn stop(&mut self) {
        if !self.running || self.fds.is_empty() {
            return;
        }
        unsafe { libc::ioctl(self.fds[0], sys::PERF_EVENT_IOC_DISABLE as _, 0) };
        self.running = false;
    }

    /// Reads the current value of the first event. For a single-event
    /// counter this is faster and more ergonomic than
    /// [`read_group`](Counter::read_group).
    pub fn read_one(&mut self) -> Result<Count> {
        let mut counts = [Count::default()];
        self.read_group(&mut counts)?;
        let [count] = counts;
        Ok(count)
    }

    /// Reads the current value of every event in the group into `counts`.
    /// All members share one read, so time_enabled and time_running are
    /// identical across them.
    pub fn read_group(&mut self, counts: &mut [Count]) -> Result<()> {
        if self.fds.is_empty() {
            bail!("counter is closed");
        }
        let n = unsafe {
            libc::read(
                self.fds[0],
                self.read_buf.as_mut_ptr() as *mut libc::c_void,
                self.read_buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if (n as usize) < GROUP_READ_HEADER_SIZE {
            bail!("short counter read: {} bytes", n);
        }

        let mut header = GroupReadHeader::default();
        plain::copy_from_bytes(&mut header, &self.read_buf[..GROUP_READ_HEADER_SIZE])
            .expect("invalid read buffer");
        if header.nr != self.scales.len() as u64 {
            bail!("read returned {} events, expected {}", header.nr, self.scales.len());
        }

        for (i, count) in counts.iter_mut().enumerate().take(self.scales.len()) {
            let off = GROUP_READ_HEADER_SIZE + i * 8;
            let raw = u64::from_ne_bytes(
                self.read_buf[off..off + 8].try_into().expect("8-byte chunk"),
            );
            let (scale, unit) = &self.scales[i];
            *count = Count {
                raw,
                time_enabled: header.time_enabled,
                time_running: header.time_running,
                scale: *scale,
                unit: unit.clone(),
            };
        }
        Ok(())
    }

    /// Closes the counter and releases the target binding. Idempotent.
    pub fn close(&mut self) {
        for fd in self.fds.drain(..) {
            unsafe {
                libc::close(fd);
            }
        }
        if self.bound {
            self.bound = false;
            self.target.unbind();
        }
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        self.close();
    }
}

/// EACCES usually means the perf_event_paranoid sysctl is too strict;
/// say so rather than leaving the user with a bare permission error.
fn permission_hint(err: io::Error) -> anyhow::Error {
    const PARANOID: &str = "/proc/sys/kernel/perf_event_paranoid";
    if err.raw_os_error() == Some(libc::EACCES) {
        let level = fs::read_to_string(PARANOID)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        if level.map_or(true, |v| v > 0) {
            // We can't read it, or it's set to > 0.
            return anyhow!("{} (consider: echo 0 | sudo tee {})", err, PARANOID);
        }
    }
    anyhow!(err)
}

/// One reading of one event.
///
/// Normally `time_enabled == time_running`. When more counters are running
/// than the hardware supports, the kernel multiplexes them and
/// `time_running < time_enabled`; [`value`](Count::value) scales the raw
/// count up under the assumption that the event rate was steady.
#[derive(Debug, Clone, PartialEq)]
pub struct Count {
    /// Number of events while the counter was running.
    pub raw: u64,
    /// Total time the counter was started, in nanoseconds.
    pub time_enabled: u64,
    /// Total time the counter was actually counting, in nanoseconds.
    pub time_running: u64,
    scale: f64,
    unit: String,
}

impl Default for Count {
    fn default() -> Count {
        Count {
            raw: 0,
            time_enabled: 0,
            time_running: 0,
            scale: 1.0,
            unit: String::new(),
        }
    }
}

impl Count {
    /// The measured value, corrected for multiplexing and scaled by the
    /// event's conversion factor. Returns the value and its unit ("" for a
    /// plain count).
    pub fn value(&self) -> (f64, &str) {
        let raw = self.raw as f64;
        if self.time_running == 0 {
            // Avoid divide by zero.
            return (0.0, &self.unit);
        }
        if self.time_enabled == self.time_running && self.scale == 1.0 {
            // Common case: running the whole time, no conversion factor.
            return (raw, &self.unit);
        }
        (
            raw * (self.time_enabled as f64 / self.time_running as f64) * self.scale,
            &self.unit,
        )
    }

    #[cfg(test)]
    pub(crate) fn with_scale(raw: u64, enabled: u64, running: u64, scale: f64, unit: &str) -> Count {
        Count {
            raw,
            time_enabled: enabled,
            time_running: running,
            scale,
            unit: unit.to_string(),
        }
    }
}
