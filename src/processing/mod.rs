mod loop_worker;
mod processor;

pub use loop_worker::processing_loop;
pub use processor::{
    DeferReason, ProcessOutcome, ProcessReport, Processor, ProcessorSettings, SegmentReport,
};
