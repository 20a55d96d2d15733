//! `weaver schema`: JSON Schema of the workflow definition format.

use weaver_types::workflow::WorkflowDefinition;

pub fn print_schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(WorkflowDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_definition_fields() {
        let schema = serde_json::to_value(schemars::schema_for!(WorkflowDefinition)).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        assert!(properties.contains_key("name"));
        assert!(properties.contains_key("tasks"));
    }
}
