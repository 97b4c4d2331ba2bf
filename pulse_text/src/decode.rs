//! Lenient single-pass decoder for the text exposition format. Malformed
//! lines are skipped with a debug log, never fatal, so partial scrapes
//! still yield whatever was parseable.

use pulse_core::{label_key, validate, Bucket, Labels, MetricFamily, MetricKind, MetricValue, Quantile};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed sample line")]
    MalformedSample,

    #[error("malformed label block")]
    MalformedLabels,

    #[error("unparsable value {0:?}")]
    BadValue(String),

    #[error("malformed comment line")]
    MalformedComment,

    #[error("sample does not fit its declared family")]
    FamilyMismatch,
}

/// Decodes text-format input into metric families, in order of first
/// appearance.
pub fn decode(input: &str) -> Vec<MetricFamily> {
    let mut decoder = Decoder::default();
    for raw in input.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            if let Err(error) = decoder.ingest_comment(comment) {
                debug!(%error, line, "skipping malformed comment");
            }
            continue;
        }
        let result = parse_sample(line).and_then(|sample| decoder.ingest_sample(sample));
        if let Err(error) = result {
            debug!(%error, line, "skipping malformed sample");
        }
    }
    decoder.finish()
}

struct Sample {
    name: String,
    labels: Labels,
    value: f64,
}

#[derive(Default)]
struct Decoder {
    families: Vec<FamilyBuilder>,
    index: HashMap<String, usize>,
}

struct FamilyBuilder {
    name: String,
    help: String,
    kind: MetricKind,
    order: Vec<String>,
    metrics: HashMap<String, (Labels, ValueBuilder)>,
}

enum ValueBuilder {
    Scalar(f64),
    Histogram {
        count: u64,
        sum: f64,
        buckets: Vec<Bucket>,
    },
    Summary {
        count: u64,
        sum: f64,
        quantiles: Vec<Quantile>,
    },
}

impl Decoder {
    fn ingest_comment(&mut self, comment: &str) -> Result<(), DecodeError> {
        let comment = comment.trim_start();
        if let Some(rest) = comment.strip_prefix("HELP ") {
            let (name, help) = split_first_token(rest).ok_or(DecodeError::MalformedComment)?;
            let help = unescape(help.trim());
            self.family_mut(&name).help = help;
            return Ok(());
        }
        if let Some(rest) = comment.strip_prefix("TYPE ") {
            let (name, kind) = split_first_token(rest).ok_or(DecodeError::MalformedComment)?;
            let kind =
                MetricKind::from_name(kind.trim()).ok_or(DecodeError::MalformedComment)?;
            self.family_mut(&name).kind = kind;
            return Ok(());
        }
        // Any other comment is noise, not an error.
        Ok(())
    }

    fn ingest_sample(&mut self, sample: Sample) -> Result<(), DecodeError> {
        if let Some(&slot) = self.index.get(&sample.name) {
            return self.families[slot].push_direct(sample);
        }

        // No family under the exact sample name: the _bucket/_sum/_count
        // suffixes fold into a declared histogram or summary base family,
        // _total into a declared counter.
        for (suffix, role) in [
            ("_bucket", SuffixRole::Bucket),
            ("_sum", SuffixRole::Sum),
            ("_count", SuffixRole::Count),
            ("_total", SuffixRole::Total),
        ] {
            if let Some(base) = sample.name.strip_suffix(suffix) {
                if let Some(&slot) = self.index.get(base) {
                    let family = &mut self.families[slot];
                    if family.accepts(role) {
                        return family.push_suffixed(role, sample);
                    }
                }
            }
        }

        // Undeclared name: stands alone as an untyped family.
        let name = sample.name.clone();
        self.family_mut(&name).push_direct(sample)
    }

    fn family_mut(&mut self, name: &str) -> &mut FamilyBuilder {
        let slot = *self.index.entry(name.to_string()).or_insert_with(|| {
            self.families.push(FamilyBuilder {
                name: name.to_string(),
                help: String::new(),
                kind: MetricKind::Untyped,
                order: Vec::new(),
                metrics: HashMap::new(),
            });
            self.families.len() - 1
        });
        &mut self.families[slot]
    }

    fn finish(self) -> Vec<MetricFamily> {
        self.families
            .into_iter()
            .filter(|family| !family.metrics.is_empty())
            .map(FamilyBuilder::finish)
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SuffixRole {
    Bucket,
    Sum,
    Count,
    Total,
}

impl FamilyBuilder {
    fn accepts(&self, role: SuffixRole) -> bool {
        match role {
            SuffixRole::Bucket => self.kind == MetricKind::Histogram,
            SuffixRole::Sum | SuffixRole::Count => {
                matches!(self.kind, MetricKind::Histogram | MetricKind::Summary)
            }
            SuffixRole::Total => self.kind == MetricKind::Counter,
        }
    }

    /// Handles a sample named exactly like this family.
    fn push_direct(&mut self, sample: Sample) -> Result<(), DecodeError> {
        match self.kind {
            MetricKind::Counter | MetricKind::Gauge | MetricKind::Untyped => {
                let entry = self.entry(sample.labels);
                *entry = ValueBuilder::Scalar(sample.value);
                Ok(())
            }
            MetricKind::Summary => {
                // Summary quantile lines carry the family name plus a
                // quantile label.
                let mut labels = sample.labels;
                let quantile = labels
                    .remove("quantile")
                    .ok_or(DecodeError::FamilyMismatch)?;
                let quantile = parse_value(&quantile)?;
                match self.summary_entry(labels) {
                    ValueBuilder::Summary { quantiles, .. } => {
                        quantiles.push(Quantile {
                            quantile,
                            value: sample.value,
                        });
                        Ok(())
                    }
                    _ => Err(DecodeError::FamilyMismatch),
                }
            }
            MetricKind::Histogram => Err(DecodeError::FamilyMismatch),
        }
    }

    fn push_suffixed(&mut self, role: SuffixRole, sample: Sample) -> Result<(), DecodeError> {
        if role == SuffixRole::Total {
            let entry = self.entry(sample.labels);
            *entry = ValueBuilder::Scalar(sample.value);
            return Ok(());
        }

        let mut labels = sample.labels;
        let bound = if role == SuffixRole::Bucket {
            let le = labels.remove("le").ok_or(DecodeError::FamilyMismatch)?;
            Some(parse_value(&le)?)
        } else {
            None
        };

        let builder = if self.kind == MetricKind::Histogram {
            self.histogram_entry(labels)
        } else {
            self.summary_entry(labels)
        };
        match (role, builder) {
            (SuffixRole::Bucket, ValueBuilder::Histogram { buckets, .. }) => {
                buckets.push(Bucket {
                    upper_bound: bound.unwrap_or(f64::INFINITY),
                    cumulative_count: sample.value as u64,
                });
                Ok(())
            }
            (SuffixRole::Sum, ValueBuilder::Histogram { sum, .. })
            | (SuffixRole::Sum, ValueBuilder::Summary { sum, .. }) => {
                *sum = sample.value;
                Ok(())
            }
            (SuffixRole::Count, ValueBuilder::Histogram { count, .. })
            | (SuffixRole::Count, ValueBuilder::Summary { count, .. }) => {
                *count = sample.value as u64;
                Ok(())
            }
            _ => Err(DecodeError::FamilyMismatch),
        }
    }

    fn entry(&mut self, labels: Labels) -> &mut ValueBuilder {
        self.entry_with(labels, || ValueBuilder::Scalar(0.0))
    }

    fn histogram_entry(&mut self, labels: Labels) -> &mut ValueBuilder {
        self.entry_with(labels, || ValueBuilder::Histogram {
            count: 0,
            sum: 0.0,
            buckets: Vec::new(),
        })
    }

    fn summary_entry(&mut self, labels: Labels) -> &mut ValueBuilder {
        self.entry_with(labels, || ValueBuilder::Summary {
            count: 0,
            sum: 0.0,
            quantiles: Vec::new(),
        })
    }

    fn entry_with(
        &mut self,
        labels: Labels,
        empty: impl FnOnce() -> ValueBuilder,
    ) -> &mut ValueBuilder {
        let key = label_key(&labels);
        match self.metrics.entry(key.clone()) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                self.order.push(key);
                &mut slot.insert((labels, empty())).1
            }
            std::collections::hash_map::Entry::Occupied(slot) => &mut slot.into_mut().1,
        }
    }

    fn finish(mut self) -> MetricFamily {
        let mut metrics = Vec::with_capacity(self.order.len());
        for key in self.order {
            let Some((labels, builder)) = self.metrics.remove(&key) else {
                continue;
            };
            let value = match builder {
                ValueBuilder::Scalar(value) => MetricValue::Scalar(value),
                ValueBuilder::Histogram {
                    count,
                    sum,
                    mut buckets,
                } => {
                    buckets.sort_by(|a, b| a.upper_bound.total_cmp(&b.upper_bound));
                    MetricValue::Histogram {
                        sample_count: count,
                        sample_sum: sum,
                        buckets,
                    }
                }
                ValueBuilder::Summary {
                    count,
                    sum,
                    mut quantiles,
                } => {
                    quantiles.sort_by(|a, b| a.quantile.total_cmp(&b.quantile));
                    MetricValue::Summary {
                        sample_count: count,
                        sample_sum: sum,
                        quantiles,
                    }
                }
            };
            metrics.push(pulse_core::Metric { labels, value });
        }
        MetricFamily {
            name: self.name,
            help: self.help,
            kind: self.kind,
            metrics,
        }
    }
}

fn parse_sample(line: &str) -> Result<Sample, DecodeError> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or(DecodeError::MalformedSample)?;
    let (name, rest) = line.split_at(name_end);
    if !validate::is_valid_metric_name(name) {
        return Err(DecodeError::MalformedSample);
    }

    let (labels, value_part) = if let Some(block) = rest.strip_prefix('{') {
        let close = find_closing_brace(block)?;
        let labels = parse_labels(&block[..close])?;
        (labels, &block[close + 1..])
    } else {
        (Labels::new(), rest)
    };

    // The value is the first token after the labels; a trailing timestamp
    // is tolerated and ignored.
    let value_token = value_part
        .split_whitespace()
        .next()
        .ok_or(DecodeError::MalformedSample)?;
    let value = parse_value(value_token)?;

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
    })
}

/// Byte offset of the closing `}` of a label block, honoring quoted strings
/// and backslash escapes.
fn find_closing_brace(block: &str) -> Result<usize, DecodeError> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (offset, c) in block.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '}' if !in_quotes => return Ok(offset),
            _ => {}
        }
    }
    Err(DecodeError::MalformedLabels)
}

fn parse_labels(block: &str) -> Result<Labels, DecodeError> {
    let mut labels = Labels::new();
    for piece in split_label_pairs(block) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let eq = piece.find('=').ok_or(DecodeError::MalformedLabels)?;
        let name = piece[..eq].trim();
        if !validate::is_valid_label_name(name) {
            return Err(DecodeError::MalformedLabels);
        }
        let raw = piece[eq + 1..].trim();
        let quoted = raw
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .ok_or(DecodeError::MalformedLabels)?;
        labels.insert(name.to_string(), unescape(quoted));
    }
    Ok(labels)
}

/// Splits on commas that sit outside quoted label values.
fn split_label_pairs(block: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (offset, c) in block.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                pieces.push(&block[start..offset]);
                start = offset + 1;
            }
            _ => {}
        }
    }
    pieces.push(&block[start..]);
    pieces
}

fn parse_value(token: &str) -> Result<f64, DecodeError> {
    match token {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => token
            .parse::<f64>()
            .map_err(|_| DecodeError::BadValue(token.to_string())),
    }
}

fn split_first_token(input: &str) -> Option<(String, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.find(char::is_whitespace) {
        Some(end) => Some((input[..end].to_string(), &input[end..])),
        None => Some((input.to_string(), "")),
    }
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_to_string;
    use pulse_core::Registry;

    #[test]
    fn parses_scalar_samples_with_and_without_labels() {
        let families = decode(
            "# HELP requests_total Total requests\n\
             # TYPE requests_total counter\n\
             requests_total 5.5\n\
             # TYPE queue_depth gauge\n\
             queue_depth{queue=\"emails\"} 7 1712345678\n",
        );
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].name, "requests_total");
        assert_eq!(families[0].kind, MetricKind::Counter);
        assert_eq!(families[0].help, "Total requests");
        assert_eq!(families[0].metrics[0].value, MetricValue::Scalar(5.5));

        assert_eq!(families[1].kind, MetricKind::Gauge);
        assert_eq!(
            families[1].metrics[0].labels.get("queue").map(String::as_str),
            Some("emails")
        );
    }

    #[test]
    fn quoted_commas_and_escapes_survive() {
        let families = decode("m{path=\"a,b\",note=\"say \\\"hi\\\"\\n\"} 1\n");
        let labels = &families[0].metrics[0].labels;
        assert_eq!(labels.get("path").map(String::as_str), Some("a,b"));
        assert_eq!(
            labels.get("note").map(String::as_str),
            Some("say \"hi\"\n")
        );
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let families = decode(
            "this is not a sample\n\
             valid_metric 1\n\
             another{unclosed=\"x 2\n\
             also_valid 3\n\
             no_value{a=\"b\"}\n",
        );
        let names: Vec<&str> = families.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["valid_metric", "also_valid"]);
    }

    #[test]
    fn special_values_parse() {
        let families = decode("a +Inf\nb -Inf\nc NaN\n");
        assert_eq!(families[0].metrics[0].value, MetricValue::Scalar(f64::INFINITY));
        assert_eq!(
            families[1].metrics[0].value,
            MetricValue::Scalar(f64::NEG_INFINITY)
        );
        match families[2].metrics[0].value {
            MetricValue::Scalar(v) => assert!(v.is_nan()),
            ref other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn histogram_samples_fold_into_the_declared_family() {
        let families = decode(
            "# TYPE latency_seconds histogram\n\
             latency_seconds_bucket{le=\"1\"} 1\n\
             latency_seconds_bucket{le=\"5\"} 2\n\
             latency_seconds_bucket{le=\"+Inf\"} 3\n\
             latency_seconds_sum 7.7\n\
             latency_seconds_count 3\n",
        );
        assert_eq!(families.len(), 1);
        match &families[0].metrics[0].value {
            MetricValue::Histogram {
                sample_count,
                sample_sum,
                buckets,
            } => {
                assert_eq!(*sample_count, 3);
                assert!((*sample_sum - 7.7).abs() < 1e-9);
                assert_eq!(buckets.len(), 3);
                assert_eq!(buckets[2].cumulative_count, 3);
                assert!(buckets[2].upper_bound.is_infinite());
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn summary_quantiles_fold_into_the_declared_family() {
        let families = decode(
            "# TYPE sizes summary\n\
             sizes{quantile=\"0.5\"} 2\n\
             sizes{quantile=\"0.9\"} 3\n\
             sizes_sum 6\n\
             sizes_count 3\n",
        );
        match &families[0].metrics[0].value {
            MetricValue::Summary {
                sample_count,
                quantiles,
                ..
            } => {
                assert_eq!(*sample_count, 3);
                assert_eq!(quantiles.len(), 2);
                assert_eq!(quantiles[0].quantile, 0.5);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn total_folds_only_into_a_declared_counter() {
        let families = decode(
            "# TYPE requests counter\n\
             requests_total 5\n\
             orphan_total 7\n",
        );
        let names: Vec<&str> = families.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["requests", "orphan_total"]);
        assert_eq!(families[1].kind, MetricKind::Untyped);
    }

    #[test]
    fn undeclared_samples_become_untyped_families() {
        let families = decode("mystery{a=\"1\"} 2\n");
        assert_eq!(families[0].kind, MetricKind::Untyped);
        assert_eq!(families[0].name, "mystery");
    }

    #[test]
    fn encode_decode_round_trip_preserves_families() {
        let registry = Registry::new();
        let requests = registry.counter("requests_total", "Total requests").unwrap();
        requests.add(5.5);
        registry.gauge("queue_depth", "Queue depth").unwrap().set(-3.25);
        let vec = registry
            .histogram_vec("latency_seconds", "Latency", &["route"], &[1.0, 5.0])
            .unwrap();
        let latency = vec.with_label_values(&["/a"]).unwrap();
        latency.observe(0.5);
        latency.observe(1.25);
        latency.observe(6.0);

        let original = registry.gather();
        let decoded = decode(&encode_to_string(&original));
        assert_eq!(decoded, original);
    }

    #[test]
    fn consecutive_gathers_encode_identically() {
        let registry = Registry::new();
        registry.counter("requests_total", "Total").unwrap().add(4.0);
        let histogram = registry
            .histogram("latency_seconds", "Latency", &[0.1, 1.0])
            .unwrap();
        histogram.observe(0.05);
        histogram.observe(2.0);
        registry.summary("sizes", "Sizes", &[0.5, 0.9]).unwrap().observe(12.0);

        let first = encode_to_string(&registry.gather());
        let second = encode_to_string(&registry.gather());
        assert_eq!(first, second);
    }
}
