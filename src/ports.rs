use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

/// Parse a port list such as `9100, 631, 8000-8010`.
///
/// Entries are separated by commas or newlines. A range is inclusive. Anything after `#` on a
/// line is a comment. Duplicates are dropped and first-seen order is kept, because the slow path
/// tries ports in that order.
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for (line_no, line) in s.lines().enumerate().map(|(i, l)| (i + 1, l)) {
        let body = line.split_once('#').map_or(line, |(before, _)| before);
        for item in body.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let span = parse_item(item).with_context(|| format!("line {line_no}: {item:?}"))?;
            out.extend(span.filter(|p| seen.insert(*p)));
        }
    }

    Ok(out)
}

/// Read and parse a ports file.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ports file: {}", path.display()))?;
    parse_ports_str(&content)
}

/// Raw JetDirect, IPP, LPD, then the embedded web server.
pub fn default_ports() -> Vec<u16> {
    vec![9100, 631, 515, 80, 443]
}

fn parse_item(item: &str) -> Result<RangeInclusive<u16>> {
    let Some((a, b)) = item.split_once('-') else {
        let p = port(item)?;
        return Ok(p..=p);
    };
    let (start, end) = (port(a.trim())?, port(b.trim())?);
    if start > end {
        bail!("range {start}-{end} is reversed");
    }
    Ok(start..=end)
}

fn port(s: &str) -> Result<u16> {
    match s.parse::<u16>() {
        Ok(0) => bail!("port 0 is not scannable"),
        Ok(p) => Ok(p),
        Err(e) => Err(anyhow!("not a port number (1-65535): {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_comma_list_keeps_order() {
        let ports = parse_ports_str("9100, 631,515").unwrap();
        assert_eq!(ports, vec![9100, 631, 515]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let input = "8000-8002\n80\n8001\n";
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_ports_str("70000\n").is_err());
        assert!(parse_ports_str("9100-9000").is_err());
    }

    #[test]
    fn default_is_print_service_ports() {
        assert_eq!(default_ports(), vec![9100, 631, 515, 80, 443]);
    }
}
