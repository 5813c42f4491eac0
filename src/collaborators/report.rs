use crate::session::{SessionReport, TerminationReason};

/// Receives the finished session, exactly once per session
pub trait ReportSink: Send {
    fn report(&mut self, report: &SessionReport);
}

/// Writes the report to the log
#[derive(Debug, Default)]
pub struct LogReportSink;

impl ReportSink for LogReportSink {
    fn report(&mut self, report: &SessionReport) {
        let summary = format!(
            "Test session finished after {:.1}s: {}",
            report.duration.as_secs_f32(),
            report.reason
        );
        match report.reason {
            TerminationReason::Success => log::info!("{summary}"),
            _ => log::error!("{summary}"),
        }

        if report.output.is_empty() {
            log::warn!("The driver produced no output");
        } else {
            log::info!("Driver output:\n{}", report.output_text());
        }
    }
}
