use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rhd_backend::{BoardConfig, ChipId, Result};
use rhdstream_backend::simulated::*;
use rhdstream_backend::*;

fn main() -> Result<()> {
    env_logger::init();

    let sim = SimulatedBoard::new(
        SimConfig::default()
            .with_headstage(0, SimHeadstage::new(ChipId::Rhd2164).with_impedance(450.0e3))
            .with_headstage(4, SimHeadstage::new(ChipId::Rhd2132).with_good_delays(3..=6)),
    );
    let source = RhdSource::new(Box::new(sim), BoardConfig::default())?;
    println!(
        "{} channels at {} S/s, MISO delays {:?}",
        source.num_channels(),
        source.sample_rate(),
        source.board().cable_delays()
    );

    let report = source.run_impedance_test(&AtomicBool::new(false))?;
    for m in report.measurements.iter().step_by(16) {
        println!("stream {} channel {:2}: {:8.1} kOhm {:6.1} deg", m.stream, m.channel, m.magnitude / 1e3, m.phase);
    }

    source.start_acquisition()?;
    std::thread::sleep(Duration::from_millis(200));
    source.stop_acquisition()?;
    let blocks = source.pull_blocks(usize::MAX);
    println!("{} blocks pulled after stop", blocks.len());
    Ok(())
}
