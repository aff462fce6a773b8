//! Just enough of the Praat TextGrid long format to find the spoken extent
//! of an utterance.

use std::sync::LazyLock;

use regex::Regex;

use super::AlignError;

static ITEM: LazyLock<Regex> = LazyLock::new(|| re(r"^\s*item\s*\[(\d+)\]\s*:"));
static INTERVAL: LazyLock<Regex> = LazyLock::new(|| re(r"^\s*intervals\s*\[\d+\]\s*:"));
static BOUND: LazyLock<Regex> =
    LazyLock::new(|| re(r"^\s*(xmin|xmax)\s*=\s*([-+0-9.eE]+)\s*$"));
static TEXT: LazyLock<Regex> = LazyLock::new(|| re(r#"^\s*text\s*=\s*"(.*)"\s*$"#));

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid built-in pattern {pattern}: {err}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub xmin: f64,
    pub xmax: f64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtteranceBounds {
    pub start_secs: f64,
    pub end_secs: f64,
}

/// Intervals of the first tier, in file order, plus the tier's own extent.
pub fn first_tier(contents: &str) -> Result<(Vec<Interval>, (f64, f64)), AlignError> {
    let mut in_first = false;
    let mut tier_bounds: (Option<f64>, Option<f64>) = (None, None);
    let mut intervals = Vec::new();
    let mut current: Option<(Option<f64>, Option<f64>)> = None;

    for line in contents.lines() {
        if let Some(caps) = ITEM.captures(line) {
            if in_first {
                break;
            }
            in_first = &caps[1] == "1";
            continue;
        }
        if !in_first {
            continue;
        }
        if INTERVAL.is_match(line) {
            current = Some((None, None));
            continue;
        }
        if let Some(caps) = BOUND.captures(line) {
            let value: f64 = caps[2]
                .parse()
                .map_err(|_| AlignError::Malformed(format!("bad time value in '{}'", line.trim())))?;
            let slot = match current.as_mut() {
                Some(interval) => interval,
                None => &mut tier_bounds,
            };
            if &caps[1] == "xmin" {
                slot.0 = Some(value);
            } else {
                slot.1 = Some(value);
            }
            continue;
        }
        if let Some(caps) = TEXT.captures(line) {
            if let Some((Some(xmin), Some(xmax))) = current.take() {
                intervals.push(Interval {
                    xmin,
                    xmax,
                    text: caps[1].replace("\"\"", "\""),
                });
            }
        }
    }

    match tier_bounds {
        (Some(xmin), Some(xmax)) if in_first => Ok((intervals, (xmin, xmax))),
        _ => Err(AlignError::Malformed("no interval tier found".into())),
    }
}

/// First to last non-empty interval; the whole tier when nothing was spoken.
pub fn spoken_bounds(contents: &str) -> Result<UtteranceBounds, AlignError> {
    let (intervals, (tier_min, tier_max)) = first_tier(contents)?;
    let mut spoken = intervals.iter().filter(|i| !i.text.trim().is_empty());
    let bounds = match (spoken.next(), spoken.last()) {
        (Some(first), Some(last)) => UtteranceBounds {
            start_secs: first.xmin,
            end_secs: last.xmax,
        },
        (Some(only), None) => UtteranceBounds {
            start_secs: only.xmin,
            end_secs: only.xmax,
        },
        _ => UtteranceBounds {
            start_secs: tier_min,
            end_secs: tier_max,
        },
    };
    if bounds.end_secs < bounds.start_secs {
        return Err(AlignError::Malformed("interval ends before it starts".into()));
    }
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRID: &str = r#"File type = "ooTextFile"
Object class = "TextGrid"

xmin = 0
xmax = 2.5
tiers? <exists>
size = 2
item []:
    item [1]:
        class = "IntervalTier"
        name = "words"
        xmin = 0
        xmax = 2.5
        intervals: size = 4
        intervals [1]:
            xmin = 0
            xmax = 0.31
            text = ""
        intervals [2]:
            xmin = 0.31
            xmax = 0.9
            text = "hello"
        intervals [3]:
            xmin = 0.9
            xmax = 2.1
            text = "there"
        intervals [4]:
            xmin = 2.1
            xmax = 2.5
            text = ""
    item [2]:
        class = "IntervalTier"
        name = "phones"
        xmin = 0
        xmax = 2.5
        intervals: size = 1
        intervals [1]:
            xmin = 0.05
            xmax = 2.45
            text = "HH"
"#;

    #[test]
    fn finds_first_and_last_spoken_interval() {
        let bounds = spoken_bounds(GRID).unwrap();
        assert_eq!(bounds.start_secs, 0.31);
        assert_eq!(bounds.end_secs, 2.1);
    }

    #[test]
    fn reads_only_the_first_tier() {
        let (intervals, tier) = first_tier(GRID).unwrap();
        assert_eq!(intervals.len(), 4);
        assert_eq!(tier, (0.0, 2.5));
        assert_eq!(intervals[2].text, "there");
    }

    #[test]
    fn silent_utterance_spans_the_tier() {
        let grid = GRID.replace("\"hello\"", "\"\"").replace("\"there\"", "\"\"");
        let bounds = spoken_bounds(&grid).unwrap();
        assert_eq!((bounds.start_secs, bounds.end_secs), (0.0, 2.5));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            spoken_bounds("not a textgrid"),
            Err(AlignError::Malformed(_))
        ));
    }
}
