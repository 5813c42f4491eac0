//! The bridge's external collaborators: firmware upload, test script discovery and reporting.
//! Each one is a trait so sessions can be driven without hardware.

mod report;
mod scripts;
mod upload;

pub use report::{LogReportSink, ReportSink};
pub use scripts::{join_script_list, FixedScripts, ScriptSource, SuiteDirectory};
pub use upload::{CommandUploader, SkipUpload, Uploader};
