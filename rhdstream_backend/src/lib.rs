//! Device layer of the RHD2000 acquisition engine, built on [`rhd_backend`].
//!
//! - [`transport`]: the `Transport` trait and the board protocol layered on it.
//! - [`okfrontpanel`]: FrontPanel USB transport loaded at runtime.
//! - [`simulated`]: in-process simulated board for tests and demos.
//! - [`board`]: `BoardController`, the single owner of device configuration.
//! - [`scheduler`]: fixed-period timer thread.
//! - [`acquisition`]: FIFO draining and decode on every timer tick.
//! - [`impedance_test`]: electrode impedance measurement.
//! - [`source`]: `RhdSource`, the host-facing entry point.

pub mod acquisition;
pub mod board;
pub mod okfrontpanel;
pub mod scheduler;
pub mod simulated;
pub mod source;
pub mod transport;

#[cfg(feature = "python")]
pub mod py_wrap;

pub use crate::acquisition::*;
pub use crate::board::*;
pub use crate::impedance_test::*;
pub use crate::scheduler::{ScheduledCallback, TimerTask};
pub use crate::source::*;
pub use crate::transport::{RhythmExt, Transport};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn rhdstream_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<py_wrap::PyRhdSource>()?;
    Ok(())
}
