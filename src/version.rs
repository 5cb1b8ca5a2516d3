use std::ops::RangeInclusive;

/// Parses `major[.minor[.build]]`.
pub fn parse_version(version: &str) -> Option<(usize, usize, usize)> {
    let mut parts = version.trim().split('.');

    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    let build = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };

    if parts.next().is_some() {
        return None;
    }

    Some((major, minor, build))
}

/// Range of operating system versions an overlay applies to.
#[derive(Clone, Debug)]
pub struct VersionRange {
    major: RangeInclusive<usize>,
    minor: RangeInclusive<usize>,
    build: RangeInclusive<usize>,
}

impl VersionRange {
    /// Every version starting with `major`.
    pub fn since(major: usize) -> Self {
        Self {
            major: major..=usize::MAX,
            minor: 0..=usize::MAX,
            build: 0..=usize::MAX,
        }
    }

    /// Every version before `major`.
    pub fn before(major: usize) -> Self {
        Self {
            major: 0..=major.saturating_sub(1),
            minor: 0..=usize::MAX,
            build: 0..=usize::MAX,
        }
    }

    pub fn contains(&self, (major, minor, build): &(usize, usize, usize)) -> bool {
        self.major.contains(major) && self.minor.contains(minor) && self.build.contains(build)
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        let bound = |v: usize| {
            if v == usize::MAX {
                "*".to_string()
            } else {
                v.to_string()
            }
        };

        if self.major.start() == self.major.end()
            && self.minor.start() == self.minor.end()
            && self.build.start() == self.build.end()
        {
            write!(
                f,
                "{}.{}.{}",
                self.major.start(),
                self.minor.start(),
                self.build.start()
            )
        } else {
            write!(
                f,
                "{}.{}.{}-{}.{}.{}",
                self.major.start(),
                self.minor.start(),
                self.build.start(),
                bound(*self.major.end()),
                bound(*self.minor.end()),
                bound(*self.build.end())
            )
        }
    }
}

impl PartialEq<(usize, usize, usize)> for VersionRange {
    fn eq(&self, version: &(usize, usize, usize)) -> bool {
        self.contains(version)
    }
}

impl From<(usize, usize, usize)> for VersionRange {
    fn from((x, y, z): (usize, usize, usize)) -> Self {
        Self::from((x, y..=y, z..=z))
    }
}

impl From<(usize, usize)> for VersionRange {
    fn from((major, minor): (usize, usize)) -> Self {
        Self::from((major, minor..=minor, 0..=usize::MAX))
    }
}

impl From<usize> for VersionRange {
    fn from(major: usize) -> Self {
        Self::from((major, 0..=usize::MAX, 0..=usize::MAX))
    }
}

impl From<(usize, RangeInclusive<usize>, RangeInclusive<usize>)> for VersionRange {
    fn from((major, minor, build): (usize, RangeInclusive<usize>, RangeInclusive<usize>)) -> Self {
        Self {
            major: major..=major,
            minor,
            build,
        }
    }
}

impl From<(usize, RangeInclusive<usize>)> for VersionRange {
    fn from((major, minor): (usize, RangeInclusive<usize>)) -> Self {
        Self::from((major, minor, 0..=usize::MAX))
    }
}
