//! End-to-end tests for the continuous query engine

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tidewater_catalog::{Field, FieldType, Schema, SchemaCatalog, SerializationFormat, StreamDefinition};
use tidewater_core::{MemoryStreamLog, Record, StreamLog, Value};
use tidewater_observability::metrics::QUERY_MESSAGES_FAILED_TOTAL;
use tidewater_sql::*;

fn engine() -> QueryEngine {
    QueryEngine::new(
        Arc::new(SchemaCatalog::in_memory()),
        Arc::new(MemoryStreamLog::new()),
        EngineConfig {
            batch_size: 8,
            idle_poll_interval_ms: 50,
            ..EngineConfig::default()
        },
    )
}

fn reading_type() -> FieldType {
    FieldType::Struct {
        fields: vec![
            Field::new("value", FieldType::Double),
            Field::new("ts", FieldType::Text),
        ],
    }
}

fn station_a(partitions: u32) -> StreamDefinition {
    StreamDefinition::new(
        "STATION_A",
        Schema::new(vec![
            Field::new("stationId", FieldType::Text),
            Field::new("reading", reading_type()),
        ]),
    )
    .with_partitions(partitions)
}

fn station_b() -> StreamDefinition {
    StreamDefinition::new(
        "STATION_B",
        Schema::new(vec![
            Field::new("stationId", FieldType::Text),
            Field::new("readings", FieldType::array_of(reading_type())),
        ]),
    )
}

fn path(text: &str) -> Expr {
    Expr::path(text).unwrap()
}

async fn wait_for_processed(engine: &QueryEngine, query_id: &str, n: u64) -> QueryStats {
    for _ in 0..300 {
        let stats = engine.get_stats(query_id).await.unwrap();
        if stats.messages_processed >= n {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("query {query_id} did not process {n} records");
}

async fn read_all(engine: &QueryEngine, stream: &str) -> Vec<Record> {
    let log = engine.log();
    let mut records = Vec::new();
    for partition in 0..log.partition_count(stream).await.unwrap() {
        records.extend(log.read(stream, partition, 0, usize::MAX).await.unwrap());
    }
    records
}

fn json(record: &Record) -> serde_json::Value {
    serde_json::from_slice(&record.value).unwrap()
}

#[tokio::test]
async fn test_scenario_a_nested_struct_projection() {
    let engine = engine();
    engine.create_stream(station_a(1)).await.unwrap();

    let query = QueryDefinition::new("STATION_A", "READINGS_A")
        .project("READING_VALUE", path("reading.value"));
    let handle = engine.submit_query(query).await.unwrap();

    engine
        .produce_raw(
            "STATION_A",
            0,
            None,
            Bytes::from(r#"{"reading":{"value":0.0,"ts":"2018-08-30T04:00:00Z"}}"#),
        )
        .await
        .unwrap();

    let stats = wait_for_processed(&engine, &handle.query_id, 1).await;
    assert_eq!(stats.messages_emitted, 1);

    let out = read_all(&engine, "READINGS_A").await;
    assert_eq!(out.len(), 1);
    assert_eq!(json(&out[0]), serde_json::json!({"READING_VALUE": 0.0}));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_scenario_b_array_element_projection() {
    let engine = engine();
    engine.create_stream(station_b()).await.unwrap();

    let query = QueryDefinition::new("STATION_B", "FIRST_READING")
        .project("stationId", path("stationId"))
        .project("FIRST_VALUE", path("readings[0].value"));
    let handle = engine.submit_query(query).await.unwrap();

    engine
        .produce(
            "STATION_B",
            &serde_json::json!({
                "stationId": "E05",
                "readings": [
                    {"value": 0.5, "ts": "2018-08-30T04:00:00Z"},
                    {"value": 0.7, "ts": "2018-08-30T04:15:00Z"}
                ]
            })
            .into(),
        )
        .await
        .unwrap();

    wait_for_processed(&engine, &handle.query_id, 1).await;
    let out = read_all(&engine, "FIRST_READING").await;
    assert_eq!(out.len(), 1);
    assert_eq!(
        json(&out[0]),
        serde_json::json!({"stationId": "E05", "FIRST_VALUE": 0.5})
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_scenario_c_partition_by_colocates_keys() {
    let engine = engine();
    engine.create_stream(station_a(3)).await.unwrap();

    let query = QueryDefinition::new("STATION_A", "BY_STATION")
        .project("stationId", path("stationId"))
        .project("value", path("reading.value"))
        .partition_by(path("stationId"))
        .with_partitions(4);
    let handle = engine.submit_query(query).await.unwrap();

    for (partition, station) in [(0, "E05"), (2, "E05"), (1, "W12")] {
        engine
            .produce_raw(
                "STATION_A",
                partition,
                None,
                Bytes::from(format!(r#"{{"stationId":"{station}","reading":{{"value":1.0}}}}"#)),
            )
            .await
            .unwrap();
    }

    wait_for_processed(&engine, &handle.query_id, 3).await;
    let out = read_all(&engine, "BY_STATION").await;
    assert_eq!(out.len(), 3);

    let e05: Vec<&Record> = out
        .iter()
        .filter(|r| r.key.as_deref() == Some(b"E05".as_slice()))
        .collect();
    assert_eq!(e05.len(), 2);
    assert_eq!(e05[0].partition, e05[1].partition);
    assert_eq!(e05[0].partition, route(b"E05", 4));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_scenario_d_event_time_from_field() {
    let engine = engine();
    engine.create_stream(station_a(1)).await.unwrap();

    let query = QueryDefinition::new("STATION_A", "TIMED")
        .project("stationId", path("stationId"))
        .with_timestamp(
            FieldPath::parse("reading.ts").unwrap(),
            Some("yyyy-MM-dd'T'HH:mm:ssX".to_string()),
        );
    let handle = engine.submit_query(query).await.unwrap();

    engine
        .produce_raw(
            "STATION_A",
            0,
            None,
            Bytes::from(r#"{"stationId":"E05","reading":{"value":1.0,"ts":"2018-08-22T18:45:00Z"}}"#),
        )
        .await
        .unwrap();
    // unparseable time: dropped and counted
    engine
        .produce_raw(
            "STATION_A",
            0,
            None,
            Bytes::from(r#"{"stationId":"E05","reading":{"value":1.0,"ts":"noon"}}"#),
        )
        .await
        .unwrap();

    let stats = wait_for_processed(&engine, &handle.query_id, 2).await;
    assert_eq!(stats.messages_emitted, 1);
    assert_eq!(stats.messages_failed, 1);

    let out = read_all(&engine, "TIMED").await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].timestamp, 1_534_963_500_000);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_scenario_e_malformed_record_does_not_halt_partition() {
    let engine = engine();
    engine.create_stream(station_a(1)).await.unwrap();

    let query = QueryDefinition::new("STATION_A", "SURVIVORS")
        .with_id("scenario-e")
        .project("stationId", path("stationId"));
    let handle = engine.submit_query(query).await.unwrap();

    for payload in [
        r#"{"stationId":"first"}"#,
        "{definitely not json",
        r#"{"stationId":"second"}"#,
        r#"{"stationId":{"nested":"wrong shape"}}"#,
        r#"{"stationId":"third"}"#,
    ] {
        engine
            .produce_raw("STATION_A", 0, None, Bytes::from(payload))
            .await
            .unwrap();
    }

    let stats = wait_for_processed(&engine, &handle.query_id, 5).await;
    assert_eq!(stats.messages_failed, 2);
    assert_eq!(stats.messages_emitted, 3);
    assert_eq!(
        QUERY_MESSAGES_FAILED_TOTAL
            .with_label_values(&["scenario-e", "malformed"])
            .get(),
        1
    );
    assert_eq!(
        QUERY_MESSAGES_FAILED_TOTAL
            .with_label_values(&["scenario-e", "schema_mismatch"])
            .get(),
        1
    );

    let names: Vec<serde_json::Value> = read_all(&engine, "SURVIVORS")
        .await
        .iter()
        .map(|r| json(r)["stationId"].clone())
        .collect();
    assert_eq!(names, vec!["first", "second", "third"]);
    assert_eq!(handle.status().await, QueryStatus::Running);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_filter_emits_only_truthy_records() {
    let engine = engine();
    engine.create_stream(station_a(1)).await.unwrap();

    let query = QueryDefinition::new("STATION_A", "HIGH")
        .project("value", path("reading.value"))
        .filter(Expr::binary(
            BinaryOp::Gt,
            path("reading.value"),
            Expr::lit(0.5),
        ));
    let handle = engine.submit_query(query).await.unwrap();

    for value in ["0.1", "0.9", "null", "0.6"] {
        engine
            .produce_raw(
                "STATION_A",
                0,
                None,
                Bytes::from(format!(r#"{{"reading":{{"value":{value}}}}}"#)),
            )
            .await
            .unwrap();
    }

    let stats = wait_for_processed(&engine, &handle.query_id, 4).await;
    assert_eq!(stats.messages_filtered, 2);
    assert_eq!(stats.messages_emitted, 2);

    let values: Vec<f64> = read_all(&engine, "HIGH")
        .await
        .iter()
        .map(|r| json(r)["value"].as_f64().unwrap())
        .collect();
    assert_eq!(values, vec![0.9, 0.6]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_fan_in_into_shared_target() {
    let engine = engine();
    engine.create_stream(station_a(2)).await.unwrap();
    engine.create_stream(station_b()).await.unwrap();

    let from_a = QueryDefinition::new("STATION_A", "ALL_READINGS")
        .project("STATION", path("stationId"))
        .project("VALUE", path("reading.value"));
    let from_b = QueryDefinition::new("STATION_B", "ALL_READINGS")
        .project("STATION", path("stationId"))
        .project("VALUE", path("readings[0].value"));
    let ha = engine.submit_query(from_a).await.unwrap();
    let hb = engine.submit_query(from_b).await.unwrap();

    let mismatched = QueryDefinition::new("STATION_B", "ALL_READINGS")
        .project("STATION", path("stationId"))
        .project("VALUE", path("readings[0].ts"));
    assert!(matches!(
        engine.submit_query(mismatched).await,
        Err(SqlError::DuplicateQueryTarget { .. })
    ));

    engine
        .produce(
            "STATION_A",
            &serde_json::json!({"stationId": "A1", "reading": {"value": 1.0}}).into(),
        )
        .await
        .unwrap();
    engine
        .produce(
            "STATION_B",
            &serde_json::json!({"stationId": "B1", "readings": [{"value": 2.0}]}).into(),
        )
        .await
        .unwrap();

    wait_for_processed(&engine, &ha.query_id, 1).await;
    wait_for_processed(&engine, &hb.query_id, 1).await;

    let desc = engine.describe_stream("ALL_READINGS").await.unwrap();
    let columns: Vec<(String, String)> = desc
        .columns
        .into_iter()
        .map(|c| (c.name, c.type_name))
        .collect();
    assert_eq!(
        columns,
        vec![
            ("STATION".to_string(), "VARCHAR".to_string()),
            ("VALUE".to_string(), "DOUBLE".to_string()),
        ]
    );

    let mut stations: Vec<String> = read_all(&engine, "ALL_READINGS")
        .await
        .iter()
        .map(|r| json(r)["STATION"].as_str().unwrap().to_string())
        .collect();
    stations.sort();
    assert_eq!(stations, vec!["A1", "B1"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_earliest_replays_and_latest_skips_history() {
    let engine = engine();
    engine.create_stream(station_a(1)).await.unwrap();

    for i in 0..3 {
        engine
            .produce_raw(
                "STATION_A",
                0,
                None,
                Bytes::from(format!(r#"{{"stationId":"old-{i}"}}"#)),
            )
            .await
            .unwrap();
    }

    let replay = engine
        .submit_query(
            QueryDefinition::new("STATION_A", "REPLAYED").project("stationId", path("stationId")),
        )
        .await
        .unwrap();
    let live = engine
        .submit_query(
            QueryDefinition::new("STATION_A", "LIVE")
                .project("stationId", path("stationId"))
                .with_start(StartPosition::Latest),
        )
        .await
        .unwrap();

    engine
        .produce_raw("STATION_A", 0, None, Bytes::from(r#"{"stationId":"new"}"#))
        .await
        .unwrap();

    wait_for_processed(&engine, &replay.query_id, 4).await;
    wait_for_processed(&engine, &live.query_id, 1).await;

    assert_eq!(read_all(&engine, "REPLAYED").await.len(), 4);
    let live_out = read_all(&engine, "LIVE").await;
    assert_eq!(live_out.len(), 1);
    assert_eq!(json(&live_out[0])["stationId"], "new");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_partition_order_is_preserved() {
    let engine = engine();
    engine.create_stream(station_a(1)).await.unwrap();

    let handle = engine
        .submit_query(
            QueryDefinition::new("STATION_A", "ORDERED")
                .project("stationId", path("stationId"))
                .project("value", path("reading.value")),
        )
        .await
        .unwrap();

    for i in 0..50 {
        engine
            .produce_raw(
                "STATION_A",
                0,
                None,
                Bytes::from(format!(r#"{{"stationId":"s","reading":{{"value":{i}}}}}"#)),
            )
            .await
            .unwrap();
    }

    wait_for_processed(&engine, &handle.query_id, 50).await;
    let values: Vec<f64> = read_all(&engine, "ORDERED")
        .await
        .iter()
        .map(|r| json(r)["value"].as_f64().unwrap())
        .collect();
    let expected: Vec<f64> = (0..50).map(|i| i as f64).collect();
    assert_eq!(values, expected);

    let info = engine.query_info(&handle.query_id).await.unwrap();
    assert_eq!(info.cursors[0].offset, 50);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_avro_source_and_target() {
    let engine = engine();
    engine
        .create_stream(station_a(1).with_format(SerializationFormat::Avro))
        .await
        .unwrap();

    let handle = engine
        .submit_query(
            QueryDefinition::new("STATION_A", "MASKED")
                .project(
                    "STATION",
                    Expr::call("mask_right", vec![path("stationId"), Expr::lit(2), Expr::lit("*")]),
                )
                .project("VALUE", path("reading.value")),
        )
        .await
        .unwrap();

    let desc = engine.describe_stream("MASKED").await.unwrap();
    assert_eq!(desc.format, SerializationFormat::Avro);

    let value: Value = serde_json::json!({
        "stationId": "E05",
        "reading": {"value": 0.1, "ts": "2018-08-30T04:00:00Z"}
    })
    .into();
    engine.produce("STATION_A", &value).await.unwrap();

    wait_for_processed(&engine, &handle.query_id, 1).await;
    let out = read_all(&engine, "MASKED").await;
    assert_eq!(out.len(), 1);

    let decoded = engine
        .catalog()
        .codec("MASKED")
        .await
        .unwrap()
        .decode(&out[0].value)
        .unwrap();
    assert_eq!(
        decoded,
        Value::structure([("STATION", Value::from("E**")), ("VALUE", Value::Double(0.1))])
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_declared_stream_timestamp_and_input_key() {
    let engine = engine();
    engine
        .create_stream(
            StreamDefinition::new(
                "EVENTS",
                Schema::new(vec![
                    Field::new("user", FieldType::Text),
                    Field::new("at", FieldType::Text),
                ]),
            )
            .with_partitions(2)
            .with_key_fields(vec!["user".to_string()])
            .with_timestamp("at", Some("yyyy-MM-dd HH:mm:ss".to_string())),
        )
        .await
        .unwrap();

    let handle = engine
        .submit_query(
            QueryDefinition::new("EVENTS", "USERS")
                .project("user", path("user"))
                .project("KEY", Expr::Meta(MetaColumn::Rowkey)),
        )
        .await
        .unwrap();

    let produced = engine
        .produce(
            "EVENTS",
            &serde_json::json!({"user": "ada", "at": "2018-08-22 18:45:00"}).into(),
        )
        .await
        .unwrap();
    assert_eq!(produced.key, Some(Bytes::from("ada")));

    wait_for_processed(&engine, &handle.query_id, 1).await;
    let out = read_all(&engine, "USERS").await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].timestamp, 1_534_963_500_000);
    assert_eq!(out[0].key, Some(Bytes::from("ada")));
    assert_eq!(out[0].partition, route(b"ada", 2));
    assert_eq!(json(&out[0]), serde_json::json!({"user": "ada", "KEY": "ada"}));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_fan_in_sources_with_different_shapes() {
    let engine = engine();
    engine.create_stream(station_a(1)).await.unwrap();
    engine.create_stream(station_b()).await.unwrap();

    // `reading` only exists in STATION_A; from STATION_B the column is always null
    let query = QueryDefinition::new("STATION_A", "MERGED")
        .with_source("STATION_B")
        .project("STATION", path("stationId"))
        .project("VALUE", path("reading.value"));
    let handle = engine.submit_query(query).await.unwrap();

    let desc = engine.describe_stream("MERGED").await.unwrap();
    let types: Vec<String> = desc.columns.into_iter().map(|c| c.type_name).collect();
    assert_eq!(types, vec!["VARCHAR".to_string(), "DOUBLE".to_string()]);

    engine
        .produce(
            "STATION_A",
            &serde_json::json!({"stationId": "A1", "reading": {"value": 1.0}}).into(),
        )
        .await
        .unwrap();
    engine
        .produce(
            "STATION_B",
            &serde_json::json!({"stationId": "B1", "readings": [{"value": 2.0}]}).into(),
        )
        .await
        .unwrap();

    let stats = wait_for_processed(&engine, &handle.query_id, 2).await;
    assert_eq!(stats.messages_emitted, 2);

    let mut out: Vec<serde_json::Value> = read_all(&engine, "MERGED").await.iter().map(json).collect();
    out.sort_by_key(|v| v["STATION"].as_str().map(str::to_string));
    assert_eq!(
        out,
        vec![
            serde_json::json!({"STATION": "A1", "VALUE": 1.0}),
            serde_json::json!({"STATION": "B1", "VALUE": null}),
        ]
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_event_time_from_projected_column() {
    let engine = engine();
    engine.create_stream(station_a(1)).await.unwrap();

    let query = QueryDefinition::new("STATION_A", "TIMED_OUT")
        .project("stationId", path("stationId"))
        .project("TS", path("reading.ts"))
        .with_timestamp(
            FieldPath::parse("TS").unwrap(),
            Some("yyyy-MM-dd'T'HH:mm:ssX".to_string()),
        );
    let handle = engine.submit_query(query).await.unwrap();

    engine
        .produce(
            "STATION_A",
            &serde_json::json!({"stationId": "E05", "reading": {"ts": "2018-08-22T18:45:00Z"}})
                .into(),
        )
        .await
        .unwrap();

    let stats = wait_for_processed(&engine, &handle.query_id, 1).await;
    assert_eq!(stats.messages_emitted, 1);
    assert_eq!(stats.messages_failed, 0);
    let out = read_all(&engine, "TIMED_OUT").await;
    assert_eq!(out[0].timestamp, 1_534_963_500_000);

    // a field found in neither the output nor the source is refused up front
    let unknown = QueryDefinition::new("STATION_A", "UNTIMED")
        .project("stationId", path("stationId"))
        .with_timestamp(FieldPath::parse("TS").unwrap(), None);
    assert!(matches!(
        engine.submit_query(unknown).await,
        Err(SqlError::InvalidQuery(_))
    ));
    assert!(engine.describe_stream("UNTIMED").await.is_err());

    engine.shutdown().await;
}
