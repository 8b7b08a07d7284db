use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rhd_backend::*;
use rhdstream_backend::simulated::*;
use rhdstream_backend::transport::endpoint;
use rhdstream_backend::*;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn two_headstages() -> SimConfig {
    SimConfig::default()
        .with_headstage(0, SimHeadstage::new(ChipId::Rhd2132))
        .with_headstage(2, SimHeadstage::new(ChipId::Rhd2132))
}

fn source(config: SimConfig) -> (RhdSource, SimHandle) {
    init_logger();
    let sim = SimulatedBoard::new(config);
    let handle = sim.handle();
    let board_config = BoardConfig {
        timer_period_ms: 2,
        ..Default::default()
    };
    (RhdSource::new(Box::new(sim), board_config).unwrap(), handle)
}

#[test]
fn missing_board_is_reported() {
    init_logger();
    let sim = SimulatedBoard::new(SimConfig::default().without_board());
    let result = RhdSource::new(Box::new(sim), BoardConfig::default());
    assert!(matches!(result, Err(RhdError::DeviceNotFound(_))));
}

#[test]
fn rejected_bitstream_is_fatal() {
    init_logger();
    let sim = SimulatedBoard::new(SimConfig {
        reject_bitstream: true,
        ..two_headstages()
    });
    match RhdSource::new(Box::new(sim), BoardConfig::default()) {
        Err(e) => assert!(matches!(e, RhdError::UploadFailed(_)) && e.is_fatal()),
        Ok(_) => panic!("upload should fail"),
    }
}

#[test]
fn two_headstages_give_64_channels() {
    let (source, handle) = source(two_headstages());
    assert_eq!(source.num_channels(), 64);
    assert_eq!(source.board().with_channels(|m| m.num_enabled_streams()), 2);
    assert_eq!(handle.wire(endpoint::STREAM_ENABLE), 0b101);
    assert!(handle.is_configured());
}

#[test]
fn starved_fifo_still_updates() {
    let (source, handle) = source(two_headstages());
    handle.set_starved(true);
    source.board().start_acquisition().unwrap();
    assert!(source.update_buffer());
    assert!(source.pull_blocks(usize::MAX).is_empty());
    source.stop_acquisition().unwrap();
}

#[test]
fn unplugged_board_fails_update() {
    let (source, handle) = source(two_headstages());
    source.start_acquisition().unwrap();
    handle.unplug();
    std::thread::sleep(Duration::from_millis(10));
    assert!(!source.update_buffer());
    assert!(!source.found_input_source());
    assert!(source.stop_acquisition().is_ok());
}

#[test]
fn stop_leaves_nothing_queued() {
    let (source, handle) = source(two_headstages());
    handle.set_blocks_per_poll(4);
    source.start_acquisition().unwrap();
    std::thread::sleep(Duration::from_millis(30));
    source.stop_acquisition().unwrap();
    assert!(!source.is_timer_active());
    assert!(!source.is_acquisition_active());
    assert_eq!(source.acquisition().queue_len(), 0);
    assert!(source.pull_blocks(usize::MAX).is_empty());
    assert_eq!(handle.fifo_bytes(), 0);
}

#[test]
fn decoded_stream_carries_all_channel_types() {
    let (source, _) = source(two_headstages());
    source.board().enable_aux(true);
    source.board().enable_adcs(true);
    assert_eq!(source.num_channels(), 64 + 6 + 8);
    source.board().start_acquisition().unwrap();
    assert!(source.update_buffer());
    let blocks = source.pull_blocks(1);
    assert_eq!(blocks[0].num_channels(), 78);
    // ADC 2 of the simulated board sits 2000 counts above mid-scale
    let adc2 = blocks[0].samples[[64 + 6 + 2, 0]];
    assert!((adc2 - (32768.0 + 2000.0) * ADC_BIT_VOLTS + 5.4096).abs() < 1e-3);
    source.stop_acquisition().unwrap();
}

#[test]
fn impedance_of_simulated_electrodes() {
    let config = SimConfig::default()
        .with_headstage(1, SimHeadstage::new(ChipId::Rhd2164).with_impedance(1.0e6));
    let (source, _) = source(config);
    source.start_acquisition().unwrap();
    let report = source.run_impedance_test(&AtomicBool::new(false)).unwrap();
    assert!(report.completed);
    assert_eq!(report.measurements.len(), 64);
    for m in &report.measurements {
        assert!((m.magnitude / 1.0e6 - 1.0).abs() < 0.1, "{:?}", m);
    }
    assert!(source.is_acquisition_active());
    assert!(source.is_timer_active());
    source.stop_acquisition().unwrap();
}

#[test]
fn impedance_above_nyquist_is_refused() {
    let (source, handle) = source(two_headstages());
    let settings = ImpedanceSettings {
        frequency: 1.1 * source.sample_rate() / 2.0,
        ..Default::default()
    };
    let result = run_impedance_test(source.board(), &settings, &AtomicBool::new(false));
    assert!(matches!(result, Err(RhdError::InvalidFrequency(_))));
    assert_eq!(handle.stimulus_writes(), 0);

    let settings = ImpedanceSettings {
        frequency: 0.55 * source.sample_rate() / 2.0,
        ..Default::default()
    };
    let report = run_impedance_test(source.board(), &settings, &AtomicBool::new(false)).unwrap();
    assert!(report.completed);
    assert!(handle.stimulus_writes() > 0);
}

#[test]
fn setter_without_change_writes_nothing() {
    let (source, handle) = source(two_headstages());
    let board = source.board();
    let upper = board.set_upper_bandwidth(500.0);
    assert_ne!(upper, 500.0);
    let delay = board.set_cable_length(0, 6.0).unwrap();
    let writes = handle.register_writes();
    let epoch = board.config_epoch();
    assert_eq!(board.set_upper_bandwidth(upper), upper);
    assert_eq!(board.set_dsp_offset(board.dsp_enabled()), board.dsp_enabled());
    assert_eq!(board.set_noise_slicer_level(0), 0);
    assert_eq!(board.set_cable_length(0, 6.0).unwrap(), delay);
    assert_eq!(handle.register_writes(), writes);
    assert_eq!(board.config_epoch(), epoch);

    board.set_noise_slicer_level(30);
    assert!(board.config_epoch() > epoch);
    assert_eq!(handle.wire(endpoint::NOISE_SUPPRESS), 30);
}

#[test]
fn dac_slot_rebinding_is_last_write_wins() {
    let (source, handle) = source(two_headstages());
    let board = source.board();
    board.set_dac_channel(0, 1, 3).unwrap();
    board.set_dac_channel(0, 0, 1).unwrap();
    assert_eq!(board.dac_channels()[0], Some(DacBinding { stream: 0, channel: 1 }));
    assert_eq!(handle.wire(endpoint::DAC_SOURCE_BASE), 1 << 10 | 1);

    // Disabling the headstage behind a bound DAC unbinds it
    board.set_dac_channel(2, 1, 0).unwrap();
    assert!(board.enable_headstage(2, false));
    assert_eq!(board.dac_channels()[2], None);
    assert_eq!(handle.wire(endpoint::DAC_SOURCE_BASE + 2), 0);
}

#[test]
fn rename_survives_rescan() {
    let (source, _) = source(two_headstages());
    let board = source.board();
    board.modify_channel_name(ChannelType::Amplifier, 0, 5, "lfp-ref").unwrap();
    board.scan_ports().unwrap();
    assert_eq!(source.channels_info()[5].name, "lfp-ref");
    assert!(board.channel_modified(ChannelType::Amplifier, 0, 5).unwrap().is_modified);
}
