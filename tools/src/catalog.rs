//! Minimal whitespace-delimited ASCII particle-catalog reader.
//!
//! `rustcov`'s core treats catalog parsing as an external collaborator;
//! this is a concrete, no-frills implementation of that collaborator
//! so the `rustcov` binary has something to read. Each
//! non-empty, non-`#`-prefixed line is `x y z w [tracer]`, where
//! `tracer` is `1` or `2` and defaults to tracer 1 when omitted.

use anyhow::{bail, Context, Result};
use rustcov::geometry::Point3D;
use rustcov::particle::Particle;
use rustcov::tracer::TracerClass;
use std::io::BufRead;
use std::path::Path;

pub fn load(path: &Path) -> Result<Vec<Particle>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open catalog {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut particles = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {} of {}", lineno + 1, path.display()))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            bail!(
                "{}:{}: expected at least 4 fields (x y z w), got {}",
                path.display(),
                lineno + 1,
                fields.len()
            );
        }
        let parse = |s: &str| -> Result<f64> {
            s.parse::<f64>()
                .with_context(|| format!("{}:{}: invalid number {s:?}", path.display(), lineno + 1))
        };
        let x = parse(fields[0])?;
        let y = parse(fields[1])?;
        let z = parse(fields[2])?;
        let w = parse(fields[3])?;
        let tracer = match fields.get(4) {
            None | Some(&"1") => Some(TracerClass::One),
            Some(&"2") => Some(TracerClass::Two),
            Some(other) => bail!(
                "{}:{}: tracer tag must be 1 or 2, got {other:?}",
                path.display(),
                lineno + 1
            ),
        };
        particles.push(Particle::new(Point3D::new(x, y, z), w, tracer, particles.len() as u64));
    }

    Ok(particles)
}
