use semver::Version;

/// Parses versions the way release feeds tend to write them: an optional leading "v" and possibly missing minor or
/// patch components ("8.2" is read as "8.2.0").
pub fn parse_lenient(version: &str) -> Option<Version> {
    let version = version.trim();
    let version = version.strip_prefix(|c: char| c == 'v' || c == 'V').unwrap_or(version);

    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }

    let (core, rest) = match version.find(|c: char| c == '-' || c == '+') {
        Some(idx) => version.split_at(idx),
        None => (version, ""),
    };

    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    while parts.len() < 3 {
        parts.push("0");
    }

    Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

/// Returns true if `candidate` is a newer version than `current`. Falls back to plain inequality when either side
/// is not a recognizable version.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    match (parse_lenient(candidate), parse_lenient(current)) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => candidate.trim() != current.trim(),
    }
}

/// Returns whether `actual` meets `minimum`; an empty minimum is always met. Returns None when the versions cannot
/// be compared.
pub fn satisfies_minimum(actual: &str, minimum: &str) -> Option<bool> {
    if minimum.trim().is_empty() {
        return Some(true);
    }

    let actual = parse_lenient(actual)?;
    let minimum = parse_lenient(minimum)?;

    Some(actual >= minimum)
}
