use rhd_backend::*;

fn main() -> Result<()> {
    let config = BoardConfig::default();
    let mut map = ChannelMap::new(NamingScheme::PerStream);
    map.set_acquire_aux(true);
    map.set_streams(vec![
        DataStream::new(StreamSlot::new(0, false), ChipId::Rhd2164),
        DataStream::new(StreamSlot::new(0, true), ChipId::Rhd2164),
        DataStream::new(StreamSlot::new(3, false), ChipId::Rhd2216),
    ]);
    map.modify_channel_name(ChannelType::Amplifier, 0, 0, "reference")?;

    let fs = sample_rate_from_index(config.sample_rate_index)?;
    let mut registers = ChipRegisters::new(fs);
    let upper = registers.set_upper_bandwidth(config.upper_bandwidth);
    let lower = registers.set_lower_bandwidth(config.lower_bandwidth);
    println!("{} channels at {} S/s, band {:.2} Hz .. {:.1} Hz", map.num_channels(), fs, lower, upper);
    println!("{}", serde_json::to_string_pretty(&map.channels_info())?);

    let plan = ImpedancePlan::new(config.impedance.frequency, fs)?;
    println!("Impedance test: {:?}", plan);
    Ok(())
}
