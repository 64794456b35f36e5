use logmill_core::LogmillError;
use logmill_engine::parser;

pub fn run(line: String, json: bool) -> Result<(), LogmillError> {
    let record = parser::parse(&line)?;

    if json {
        let out = serde_json::json!({
            "timestamp": record.timestamp,
            "severity": record.severity,
            "service_name": record.service_name,
            "body": record.body,
            "context": record.context,
            "trace_id": record.trace_id,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("timestamp:  {}", record.timestamp.to_rfc3339());
    println!("severity:   {}", record.severity);
    println!("service:    {}", record.service_name);
    println!("body:       {}", record.body);
    if let Some(trace_id) = &record.trace_id {
        println!("trace_id:   {trace_id}");
    }
    if let Some(context) = record.context.as_ref().filter(|c| !c.is_empty()) {
        println!("context:");
        for (key, value) in context {
            println!("  {key} = {value}");
        }
    }
    Ok(())
}
