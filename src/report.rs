//! Console rendering of a finished run.

use std::{
    fmt::Display,
    io::{self, Write},
};

use crate::{
    nrmx::{Error, SemOffsetMargin},
    orchestrator::{ResultSnapshot, RunSummary},
    timing::as_millis_f64,
};

fn field<W: Write>(out: &mut W, label: &str, value: impl Display) -> io::Result<()> {
    writeln!(out, "{:<47}: {}", label, value)
}

fn heading<W: Write>(out: &mut W, name: &str) -> io::Result<()> {
    writeln!(out, "\n************************* {} *************************\n", name)
}

pub fn write_summary<W: Write>(out: &mut W, summary: &RunSummary) -> io::Result<()> {
    if let Some(mean) = summary.timings.mean() {
        writeln!(
            out,
            "Execution Time: {:.3} ms (mean of {} iterations)",
            as_millis_f64(mean),
            summary.timings.len()
        )?;
    }
    write_results(out, &summary.results)
}

pub fn write_results<W: Write>(out: &mut W, results: &ResultSnapshot) -> io::Result<()> {
    heading(out, "ModAcc")?;
    field(out, "Composite RMS EVM Mean (%)", results.modacc.composite_rms_evm_mean)?;
    field(out, "Composite Peak EVM Maximum (%)", results.modacc.composite_peak_evm_maximum)?;
    field(
        out,
        "Component Carrier Frequency Error Mean (Hz)",
        results.modacc.frequency_error_mean,
    )?;
    field(
        out,
        "Component Carrier IQ Origin Offset Mean (dBc)",
        results.modacc.iq_origin_offset_mean,
    )?;

    heading(out, "CHP")?;
    field(out, "Carrier Absolute Power (dBm)", results.chp.absolute_power)?;
    field(out, "Carrier Relative Power (dB)", results.chp.relative_power)?;

    heading(out, "ACP")?;
    field(out, "Carrier Absolute Power (dBm)", results.acp_carrier.absolute_power)?;
    writeln!(out, "\n------- Offset Channel Measurements -------")?;
    for (i, offset) in results.acp_offsets.iter().enumerate() {
        writeln!(out, "\nOffset  {}", i)?;
        field(out, "Lower Relative Power (dB)", offset.lower_relative_power)?;
        field(out, "Upper Relative Power (dB)", offset.upper_relative_power)?;
        field(out, "Lower Absolute Power (dBm)", offset.lower_absolute_power)?;
        field(out, "Upper Absolute Power (dBm)", offset.upper_absolute_power)?;
    }

    heading(out, "OBW")?;
    field(out, "Occupied Bandwidth (Hz)", results.obw.occupied_bandwidth)?;
    field(out, "Absolute Power (dBm)", results.obw.absolute_power)?;
    field(out, "Start Frequency (Hz)", results.obw.start_frequency)?;
    field(out, "Stop Frequency (Hz)", results.obw.stop_frequency)?;

    heading(out, "SEM")?;
    field(out, "Measurement Status", results.sem_status)?;
    field(
        out,
        "Carrier Absolute Integrated Power (dBm)",
        results.sem_carrier.absolute_integrated_power,
    )?;
    write_sem_segments(out, "Lower", &results.sem_lower_offsets)?;
    write_sem_segments(out, "Upper", &results.sem_upper_offsets)
}

fn write_sem_segments<W: Write>(out: &mut W, side: &str, segments: &[SemOffsetMargin]) -> io::Result<()> {
    writeln!(out, "\n----- {} Offset Segment Measurements -----", side)?;
    for (i, segment) in segments.iter().enumerate() {
        writeln!(out, "\nOffset  {}", i)?;
        field(out, "Measurement Status", segment.status)?;
        field(out, "Margin (dB)", segment.margin)?;
        field(out, "Margin Frequency (Hz)", segment.margin_frequency)?;
        field(out, "Margin Absolute Power (dBm)", segment.margin_absolute_power)?;
    }
    Ok(())
}

pub fn write_error<W: Write>(out: &mut W, err: &Error) -> io::Result<()> {
    writeln!(out, "ERROR:\n{}: {}", err.kind(), err)
}
