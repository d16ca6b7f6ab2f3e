//! Metric events of one metric instance.

use crate::error::Result;
use crate::location::Location;
use crate::perf::PerfCounterGroup;
use crate::time::Timestamp;
use crate::trace::{
    Event, LocalWriter, MappingTable, MetricClass, MetricInstance, MetricScope, MetricValue, Ref,
    Trace,
};

pub struct MetricWriter {
    writer: LocalWriter,
    instance: Ref<MetricInstance>,
}

impl MetricWriter {
    pub fn new(writer: LocalWriter, instance: Ref<MetricInstance>) -> Self {
        MetricWriter { writer, instance }
    }

    /// Metric location next to `location`, recording `class` for `scope`.
    pub fn open(
        trace: &Trace,
        location: Location,
        class: Ref<MetricClass>,
        scope: MetricScope,
    ) -> Result<Self> {
        let writer = trace.metric_writer(location)?;
        let instance = trace.metric_instance(class, writer.location(), scope);
        Ok(Self::new(writer, instance))
    }

    /// Metric location in the shared metric location group.
    pub fn open_non_unique(
        trace: &Trace,
        name: &str,
        class: Ref<MetricClass>,
        scope: MetricScope,
    ) -> Result<Self> {
        let writer = trace.non_unique_metric_writer(name)?;
        let instance = trace.metric_instance(class, writer.location(), scope);
        Ok(Self::new(writer, instance))
    }

    pub fn instance(&self) -> Ref<MetricInstance> {
        self.instance
    }

    pub fn write(&mut self, time: Timestamp, values: Vec<MetricValue>) -> Result<()> {
        self.writer.write(Event::Metric {
            time,
            instance: self.instance,
            values,
        })
    }

    /// Every counter of the group, then time enabled and running.
    pub fn write_counters(&mut self, time: Timestamp, group: &PerfCounterGroup) -> Result<()> {
        let mut values: Vec<MetricValue> = group.values().map(MetricValue::Double).collect();
        values.push(MetricValue::Unsigned(group.buffer().enabled()));
        values.push(MetricValue::Unsigned(group.buffer().running()));
        self.write(time, values)
    }

    pub fn close(self) -> Result<u64> {
        self.writer.close(&[] as &[MappingTable])
    }
}
