use anyhow::Result;
use htm_temporal::core::connections::Connections;
use htm_temporal::core::random::Random;
use htm_temporal::core::sdr::Sdr;
use htm_temporal::core::serialization::TokenReader;
use htm_temporal::core::temporal_memory::{TemporalMemory, TemporalMemoryParams};
use std::io::Cursor;

fn params() -> TemporalMemoryParams {
    TemporalMemoryParams {
        column_dimensions: vec![16, 8],
        cells_per_column: 4,
        activation_threshold: 4,
        min_threshold: 3,
        max_new_synapse_count: 6,
        predicted_segment_decrement: 0.01,
        seed: 77,
        ..TemporalMemoryParams::default()
    }
}

fn random_inputs(count: usize) -> Result<Vec<Sdr>> {
    let mut rng = Random::new(5);
    (0..count)
        .map(|_| {
            let mut sdr = Sdr::new(&[16, 8])?;
            sdr.randomize_with(0.05, &mut rng)?;
            Ok(sdr)
        })
        .collect()
}

fn trained() -> Result<(TemporalMemory, Vec<Sdr>)> {
    let mut tm = TemporalMemory::new(params())?;
    let inputs = random_inputs(8)?;
    for _ in 0..5 {
        for input in &inputs {
            tm.compute(input, true)?;
        }
    }
    Ok((tm, inputs))
}

/// Feeds the same inputs to both memories and checks they stay in lockstep.
fn assert_lockstep(a: &mut TemporalMemory, b: &mut TemporalMemory, inputs: &[Sdr]) -> Result<()> {
    for _ in 0..3 {
        for input in inputs {
            a.compute(input, true)?;
            b.compute(input, true)?;
            assert_eq!(a.get_active_cells()?, b.get_active_cells()?);
            assert_eq!(a.get_winner_cells()?, b.get_winner_cells()?);
            assert_eq!(a.anomaly(), b.anomaly());
        }
    }
    assert!(*a == *b);
    Ok(())
}

#[test]
fn text_snapshot_continues_identically() -> Result<()> {
    let (mut tm, inputs) = trained()?;
    assert!(tm.connections().num_segments() > 0);

    let mut buffer = Vec::new();
    tm.save(&mut buffer)?;
    let mut restored = TemporalMemory::load(&mut TokenReader::new(Cursor::new(buffer)))?;

    assert!(restored == tm);
    assert_eq!(restored.params(), tm.params());
    assert_lockstep(&mut tm, &mut restored, &inputs)
}

#[test]
fn binary_snapshot_continues_identically() -> Result<()> {
    let (mut tm, inputs) = trained()?;

    let mut buffer = Vec::new();
    tm.save_binary(&mut buffer)?;
    let mut restored = TemporalMemory::load_binary(&mut Cursor::new(buffer))?;

    assert!(restored == tm);
    assert_lockstep(&mut tm, &mut restored, &inputs)
}

#[test]
fn snapshot_taken_mid_step_keeps_segments() -> Result<()> {
    let (mut tm, _) = trained()?;
    tm.activate_dendrites(false)?;

    let mut buffer = Vec::new();
    tm.save(&mut buffer)?;
    let restored = TemporalMemory::load(&mut TokenReader::new(Cursor::new(buffer)))?;

    assert_eq!(restored.get_predictive_cells()?, tm.get_predictive_cells()?);
    assert_eq!(
        restored.get_matching_segments()?.len(),
        tm.get_matching_segments()?.len()
    );
    Ok(())
}

#[test]
fn connections_text_snapshot_is_structurally_equal() -> Result<()> {
    let (tm, _) = trained()?;
    let connections = tm.connections();

    let mut buffer = Vec::new();
    connections.save(&mut buffer)?;
    let restored = Connections::load(&mut TokenReader::new(Cursor::new(buffer)))?;

    assert!(restored == *connections);
    assert_eq!(restored.num_segments(), connections.num_segments());
    assert_eq!(restored.num_synapses(), connections.num_synapses());
    Ok(())
}

#[test]
fn corrupt_streams_are_rejected() -> Result<()> {
    let (tm, _) = trained()?;
    let mut buffer = Vec::new();
    tm.save(&mut buffer)?;
    let text = String::from_utf8(buffer)?;

    let wrong_marker = text.replacen("TemporalMemory", "TemporalMemoryX", 1);
    assert!(TemporalMemory::load(&mut TokenReader::new(Cursor::new(wrong_marker))).is_err());

    let truncated = &text[..text.len() / 2];
    assert!(TemporalMemory::load(&mut TokenReader::new(Cursor::new(truncated))).is_err());

    let mut bytes = Vec::new();
    tm.save_binary(&mut bytes)?;
    assert!(Connections::load_binary(&mut Cursor::new(bytes)).is_err());
    Ok(())
}
