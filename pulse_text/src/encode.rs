use pulse_core::{Labels, MetricFamily, MetricValue};
use std::io::{self, Write};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("writing exposition output: {0}")]
pub struct EncodeError(#[from] io::Error);

/// Encodes `families` into `w` in the text exposition format, in the order
/// given.
pub fn encode<W: Write>(w: &mut W, families: &[MetricFamily]) -> Result<(), EncodeError> {
    let rendered = encode_to_string(families);
    w.write_all(rendered.as_bytes())?;
    Ok(())
}

pub fn encode_to_string(families: &[MetricFamily]) -> String {
    let mut out = String::new();
    for family in families {
        write_family(&mut out, family);
    }
    out
}

fn write_family(out: &mut String, family: &MetricFamily) {
    out.push_str("# HELP ");
    out.push_str(&family.name);
    if !family.help.is_empty() {
        out.push(' ');
        out.push_str(&escape_help(&family.help));
    }
    out.push('\n');

    out.push_str("# TYPE ");
    out.push_str(&family.name);
    out.push(' ');
    out.push_str(family.kind.as_str());
    out.push('\n');

    for metric in &family.metrics {
        match &metric.value {
            MetricValue::Scalar(value) => {
                sample_line(out, &family.name, "", &metric.labels, None, *value);
            }
            MetricValue::Histogram {
                sample_count,
                sample_sum,
                buckets,
            } => {
                for bucket in buckets {
                    count_line(
                        out,
                        &family.name,
                        "_bucket",
                        &metric.labels,
                        Some(("le", format_value(bucket.upper_bound))),
                        bucket.cumulative_count,
                    );
                }
                sample_line(out, &family.name, "_sum", &metric.labels, None, *sample_sum);
                count_line(out, &family.name, "_count", &metric.labels, None, *sample_count);
            }
            MetricValue::Summary {
                sample_count,
                sample_sum,
                quantiles,
            } => {
                for quantile in quantiles {
                    sample_line(
                        out,
                        &family.name,
                        "",
                        &metric.labels,
                        Some(("quantile", format_value(quantile.quantile))),
                        quantile.value,
                    );
                }
                sample_line(out, &family.name, "_sum", &metric.labels, None, *sample_sum);
                count_line(out, &family.name, "_count", &metric.labels, None, *sample_count);
            }
        }
    }
}

fn sample_line(
    out: &mut String,
    name: &str,
    suffix: &str,
    labels: &Labels,
    extra: Option<(&str, String)>,
    value: f64,
) {
    out.push_str(name);
    out.push_str(suffix);
    write_label_block(out, labels, extra);
    out.push(' ');
    out.push_str(&format_value(value));
    out.push('\n');
}

fn count_line(
    out: &mut String,
    name: &str,
    suffix: &str,
    labels: &Labels,
    extra: Option<(&str, String)>,
    value: u64,
) {
    out.push_str(name);
    out.push_str(suffix);
    write_label_block(out, labels, extra);
    out.push(' ');
    out.push_str(&value.to_string());
    out.push('\n');
}

fn write_label_block(out: &mut String, labels: &Labels, extra: Option<(&str, String)>) {
    if labels.is_empty() && extra.is_none() {
        return;
    }
    out.push('{');
    let mut first = true;
    for (name, value) in labels {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_label_value(value));
        out.push('"');
    }
    if let Some((name, value)) = extra {
        if !first {
            out.push(',');
        }
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&value);
        out.push('"');
    }
    out.push('}');
}

/// Integral values print without a decimal point; special floats use the
/// exposition spellings.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
