use super::summary::{MetricSummary, RunSummary};

fn csv_name(name: &str) -> String {
    name.replace([' ', ':', ',', '{', '}', '"'], "_")
}

/// Generate CSV output (`metric_name,metric_type,value`) from a RunSummary.
pub fn generate_csv(summary: &RunSummary) -> String {
    let mut out = String::from("metric_name,metric_type,value\n");

    for (name, metric) in &summary.metrics {
        let name = csv_name(name);
        match metric {
            MetricSummary::Counter { count, rate } => {
                out.push_str(&format!("{}_count,counter,{}\n", name, count));
                out.push_str(&format!("{}_rate,gauge,{:.3}\n", name, rate));
            }
            MetricSummary::Gauge { value, min, max } => {
                out.push_str(&format!("{},gauge,{}\n", name, value));
                out.push_str(&format!("{}_min,gauge,{}\n", name, min));
                out.push_str(&format!("{}_max,gauge,{}\n", name, max));
            }
            MetricSummary::Rate {
                rate,
                passes,
                fails,
            } => {
                out.push_str(&format!("{},rate,{:.4}\n", name, rate));
                out.push_str(&format!("{}_passes,counter,{}\n", name, passes));
                out.push_str(&format!("{}_fails,counter,{}\n", name, fails));
            }
            MetricSummary::Trend {
                avg,
                min,
                med,
                max,
                p90,
                p95,
                p99,
                count,
            } => {
                out.push_str(&format!("{}_count,counter,{}\n", name, count));
                for (suffix, v) in [
                    ("avg", avg),
                    ("min", min),
                    ("med", med),
                    ("max", max),
                    ("p90", p90),
                    ("p95", p95),
                    ("p99", p99),
                ] {
                    out.push_str(&format!("{}_{},gauge,{:.3}\n", name, suffix, v));
                }
            }
        }
    }

    for check in &summary.checks {
        let name = csv_name(&check.name);
        out.push_str(&format!("check_{}_passes,counter,{}\n", name, check.passes));
        out.push_str(&format!("check_{}_fails,counter,{}\n", name, check.fails));
    }

    for t in &summary.thresholds {
        out.push_str(&format!(
            "threshold_{}_{},threshold,{}\n",
            csv_name(&t.metric),
            csv_name(&t.expression),
            if t.passed { 1 } else { 0 }
        ));
    }

    out
}
