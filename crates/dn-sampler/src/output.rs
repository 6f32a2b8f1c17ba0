//! Output artifact emission.
//!
//! Every write opens, writes, flushes, and closes its file in one scope,
//! so handles are released on all exit paths. The sample and sample-info
//! files only ever grow; the level table is rewritten whole because every
//! save changes every `log_x`.

use crate::level::Level;
use crate::likelihood::LogLikelihood;
use crate::options::Options;
use dn_core::{Model, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

/// Render a float for the text outputs.
///
/// `exact` selects C-style lossless hexadecimal (`0x1.921fp+1`);
/// otherwise scientific notation with 16 significant digits.
pub fn format_f64(x: f64, exact: bool) -> String {
    if !x.is_finite() {
        return if x.is_nan() {
            "nan".to_string()
        } else if x > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        };
    }
    if exact { hex_f64(x) } else { format!("{x:.16e}") }
}

/// C `%a`-style hexadecimal rendering of a finite float.
fn hex_f64(x: f64) -> String {
    let sign = if x.is_sign_negative() { "-" } else { "" };
    let bits = x.to_bits();
    let exp = ((bits >> 52) & 0x7ff) as i64;
    let mantissa = bits & 0x000f_ffff_ffff_ffff;

    if exp == 0 && mantissa == 0 {
        return format!("{sign}0x0p+0");
    }
    // Subnormals keep the 2^-1022 scale with a leading 0 digit.
    let (lead, e) = if exp == 0 { (0, -1022) } else { (1, exp - 1023) };
    let mut frac = format!("{mantissa:013x}");
    while frac.ends_with('0') {
        frac.pop();
    }
    if frac.is_empty() {
        format!("{sign}0x{lead}p{e:+}")
    } else {
        format!("{sign}0x{lead}.{frac}p{e:+}")
    }
}

/// Write the headers of the append-only outputs.
pub fn initialise<M: Model>(options: &Options, particle: &M) -> Result<()> {
    let mut out = BufWriter::new(File::create(&options.sample_info_file)?);
    writeln!(out, "# level_assignment log_likelihood tiebreaker particle_index")?;
    out.flush()?;

    let mut out = BufWriter::new(File::create(&options.sample_file)?);
    writeln!(out, "# {}", particle.description())?;
    out.flush()?;
    Ok(())
}

/// Rewrite the level table.
pub fn save_levels(options: &Options, levels: &[Level]) -> Result<()> {
    let exact = options.write_exact_representation;
    let mut out = BufWriter::new(File::create(&options.levels_file)?);
    writeln!(out, "# log_X log_likelihood tiebreaker accepts tries exceeds visits")?;
    for level in levels {
        writeln!(
            out,
            "{} {} {} {} {} {} {}",
            format_f64(level.log_x(), exact),
            format_f64(level.threshold().value(), exact),
            format_f64(level.threshold().tiebreaker(), exact),
            level.accepts(),
            level.tries(),
            level.exceeds(),
            level.visits()
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Append one particle row to the sample file.
pub fn append_sample<M: Model>(options: &Options, particle: &M) -> Result<()> {
    let mut out = BufWriter::new(OpenOptions::new().append(true).open(&options.sample_file)?);
    particle.print(&mut out)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// Append one metadata row to the sample-info file.
pub fn append_sample_info(
    options: &Options,
    level_assignment: usize,
    logl: LogLikelihood,
    particle_index: usize,
) -> Result<()> {
    let exact = options.write_exact_representation;
    let mut out = BufWriter::new(OpenOptions::new().append(true).open(&options.sample_info_file)?);
    writeln!(
        out,
        "{} {} {} {}",
        level_assignment,
        format_f64(logl.value(), exact),
        format_f64(logl.tiebreaker(), exact),
        particle_index
    )?;
    out.flush()?;
    Ok(())
}

/// Record an improvement of the best-ever particle.
pub fn append_best<M: Model>(
    options: &Options,
    count_mcmc_steps: u64,
    logl: LogLikelihood,
    particle: &M,
) -> Result<()> {
    let exact = options.write_exact_representation;
    let mut out = BufWriter::new(
        OpenOptions::new().append(true).create(true).open(&options.best_likelihood_file)?,
    );
    writeln!(
        out,
        "{} {} {}",
        count_mcmc_steps,
        format_f64(logl.value(), exact),
        format_f64(logl.tiebreaker(), exact)
    )?;
    out.flush()?;

    let mut out = BufWriter::new(
        OpenOptions::new().append(true).create(true).open(&options.best_particle_file)?,
    );
    particle.print(&mut out)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
