#[cfg(test)]
mod tests {
    use crate::connection::{ApiRequest, Connection, Method, Payload, RequestBody, Transport};
    use crate::dataset::{CreateOptions, DataRequest, DataResult, Dataset};
    use crate::error::{Error, Result};
    use crate::poll::{self, PollPolicy};
    use crate::state::ResourceState;
    use crate::{join, merge, GroupSignature};
    use async_trait::async_trait;
    use mockall::*;
    use reqwest::Url;
    use serde_json::{json, Value};
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    mock! {
        pub Transport {}
        #[async_trait]
        impl Transport for Transport {
            async fn send(&self, request: ApiRequest) -> Result<Payload>;
        }
    }

    fn connection(mock: MockTransport) -> Connection {
        Connection::with_transport(Url::parse("http://bamboo.test").unwrap(), Arc::new(mock))
    }

    fn bound(mock: MockTransport) -> Dataset {
        Dataset::attach(&connection(mock), "abc")
    }

    fn ok(value: Value) -> Result<Payload> {
        Ok(Payload::Json(value))
    }

    fn info(state: &str) -> Value {
        json!({
            "id": "abc",
            "label": "Good Eats",
            "description": "Meals rating worldwide",
            "attribution": "mberg",
            "license": "Public Domain",
            "created_at": "2013-01-25 18:22:35",
            "updated_at": "2013-01-25 18:22:40",
            "num_columns": 3,
            "num_rows": 19,
            "state": state,
            "schema": {
                "food_type": {"simpletype": "string", "olap_type": "dimension", "label": "Food Type"},
                "amount": {"simpletype": "float", "olap_type": "measure", "label": "Amount"},
                "rating": {"simpletype": "string", "olap_type": "dimension", "label": "Rating"}
            }
        })
    }

    // --- creation ---------------------------------------------------------------

    #[tokio::test]
    async fn test_create_from_file_binds_pending_dataset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "food_type,amount\nlunch,2\n").unwrap();

        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| {
                r.method == Method::Post
                    && r.path == "/datasets"
                    && r.body.file("csv_file").map(|f| f.bytes.starts_with(b"food_type")) == Some(true)
            })
            .times(1)
            .returning(|_| ok(json!({"id": "abc"})));

        let dataset = Dataset::create(&connection(mock), CreateOptions::new().path(file.path())).await;
        let dataset = assert_ok!(dataset);
        assert_eq!(dataset.id(), Some("abc"));
        assert_eq!(dataset.last_state(), Some(ResourceState::Pending));
        assert_eq!(dataset.to_string(), "abc");
    }

    #[tokio::test]
    async fn test_create_from_url_and_schema() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.body.field("url") == Some("http://formhub.org/mberg/forms/good_eats/data.csv"))
            .times(1)
            .returning(|_| ok(json!({"id": "from-url"})));
        mock.expect_send()
            .withf(|r| r.body.file("schema").is_some() && r.body.file("csv_file").is_none())
            .times(1)
            .returning(|_| ok(json!({"id": "from-schema"})));
        let connection = connection(mock);

        let from_url = Dataset::create(
            &connection,
            CreateOptions::new().url("http://formhub.org/mberg/forms/good_eats/data.csv"),
        )
        .await
        .unwrap();
        assert_eq!(from_url.id(), Some("from-url"));

        let from_schema = Dataset::create(&connection, CreateOptions::new().schema_content("{}"))
            .await
            .unwrap();
        assert_eq!(from_schema.id(), Some("from-schema"));
    }

    #[tokio::test]
    async fn test_create_validation_never_reaches_the_wire() {
        // no expectations: any request panics
        let connection = connection(MockTransport::new());

        let err = assert_err!(Dataset::create(&connection, CreateOptions::new()).await);
        assert!(err.is_validation());

        let err = assert_err!(
            Dataset::create(
                &connection,
                CreateOptions::new().path("good_eats.csv").data_format("BAD"),
            )
            .await
        );
        assert!(err.is_validation());

        let err = assert_err!(
            Dataset::create(
                &connection,
                CreateOptions::new().content("a\n1\n").url("http://example.com/a.csv"),
            )
            .await
        );
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_create_missing_file_is_io_error() {
        let connection = connection(MockTransport::new());
        let err = assert_err!(
            Dataset::create(&connection, CreateOptions::new().path("/nonexistent/good_eats.csv")).await
        );
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_create_rejected_by_server_is_remote_error() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| ok(json!({"error": "could not parse CSV"})));

        let err = assert_err!(Dataset::create(&connection(mock), CreateOptions::new().content("???")).await);
        assert!(err.is_remote());
        assert!(err.to_string().contains("could not parse CSV"));
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_uniformly() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Err(Error::remote(Some(503), "service unavailable")));

        let mut dataset = bound(mock);
        let err = assert_err!(dataset.state().await);
        assert!(matches!(err, Error::Remote { status: Some(503), .. }));
    }

    // --- lifecycle --------------------------------------------------------------

    #[tokio::test]
    async fn test_delete_unbinds_and_blocks_further_operations() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Delete && r.path == "/datasets/abc")
            .times(1)
            .returning(|_| ok(json!({"success": "deleted dataset", "id": "abc"})));

        let mut dataset = bound(mock);
        assert_ok!(dataset.delete().await);
        assert!(!dataset.is_bound());
        assert_eq!(dataset.to_string(), "");

        assert!(matches!(dataset.delete().await, Err(Error::Unbound)));
        assert!(matches!(dataset.get_info().await, Err(Error::Unbound)));
        assert!(matches!(dataset.get_data(&DataRequest::new()).await, Err(Error::Unbound)));
        assert!(matches!(
            dataset.add_calculation("double_amount", "amount * 2", None).await,
            Err(Error::Unbound)
        ));
        assert!(matches!(dataset.get_aggregate_datasets().await, Err(Error::Unbound)));
        assert!(matches!(dataset.get_row(0).await, Err(Error::Unbound)));
        assert!(matches!(dataset.version().await, Err(Error::Unbound)));
        assert!(matches!(
            dataset.reset(CreateOptions::new().content("a\n1\n"), None).await,
            Err(Error::Unbound)
        ));
    }

    #[tokio::test]
    async fn test_reset_keeps_identifier() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Put && r.path == "/datasets/abc/reset" && r.body.file("csv_file").is_some())
            .times(1)
            .returning(|_| ok(json!({"id": "abc"})));

        let mut dataset = bound(mock);
        assert_ok!(dataset.reset(CreateOptions::new().content("a\n1\n"), None).await);
        assert_eq!(dataset.id(), Some("abc"));
        assert_eq!(dataset.last_state(), Some(ResourceState::Pending));
    }

    #[tokio::test]
    async fn test_reset_with_supplied_identifier_rebinds() {
        let mut mock = MockTransport::new();
        let mut seq = Sequence::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Delete)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(json!({"success": "deleted dataset"})));
        mock.expect_send()
            .withf(|r| r.path == "/datasets/xyz/reset")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(json!({"id": "xyz"})));

        let mut dataset = bound(mock);
        dataset.delete().await.unwrap();
        dataset
            .reset(CreateOptions::new().content("a\n1\n"), Some("xyz".to_string()))
            .await
            .unwrap();
        assert_eq!(dataset.id(), Some("xyz"));
    }

    #[tokio::test]
    async fn test_state_is_refetched_on_every_read() {
        let mut mock = MockTransport::new();
        let mut seq = Sequence::new();
        mock.expect_send()
            .withf(|r| r.path == "/datasets/abc/info")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(info("pending")));
        mock.expect_send()
            .withf(|r| r.path == "/datasets/abc/info")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(info("ready")));

        let mut dataset = bound(mock);
        assert_eq!(dataset.state().await.unwrap(), ResourceState::Pending);
        assert_eq!(dataset.state().await.unwrap(), ResourceState::Ready);
        assert_eq!(dataset.last_state(), Some(ResourceState::Ready));
    }

    #[tokio::test]
    async fn test_info_accessors() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Get && r.path == "/datasets/abc/info")
            .times(4)
            .returning(|_| ok(info("ready")));

        let mut dataset = bound(mock);
        let info = dataset.get_info().await.unwrap();
        assert_eq!(info.attribution.as_deref(), Some("mberg"));
        assert_eq!(info.schema.as_ref().map(|s| s.len()), Some(3));

        let columns = dataset.columns().await.unwrap();
        assert_eq!(columns.len(), 3);
        assert!(columns.contains(&"food_type".to_string()));
        assert_eq!(dataset.num_columns().await.unwrap(), 3);
        assert_eq!(dataset.num_rows().await.unwrap(), 19);
    }

    #[tokio::test]
    async fn test_set_info_sends_only_supplied_keys() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| {
                r.method == Method::Put
                    && r.path == "/datasets/abc/info"
                    && r.body.field("label") == Some("Good Eats")
                    && r.body.field("license") == Some("Public Domain")
                    && r.body.field("description").is_none()
            })
            .times(1)
            .returning(|_| ok(json!({"id": "abc"})));

        let dataset = bound(mock);
        assert_ok!(
            dataset
                .set_info(&json!({"label": "Good Eats", "license": "Public Domain"}))
                .await
        );
        assert!(dataset.set_info(&json!("BAD")).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_version() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.path == "/version")
            .times(1)
            .returning(|_| ok(json!({"version": "0.5.7", "commit": "abc123", "branch": "master"})));

        let version = bound(mock).version().await.unwrap();
        assert_eq!(version["version"], "0.5.7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_polls_info() {
        let mut mock = MockTransport::new();
        let mut seq = Sequence::new();
        mock.expect_send()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| ok(info("pending")));
        mock.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(info("ready")));

        let mut dataset = bound(mock);
        let policy = PollPolicy {
            interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(1),
        };
        let state = poll::wait_until_settled(&mut dataset, policy).await.unwrap();
        assert_eq!(state, ResourceState::Ready);
    }

    // --- reading and writing rows ----------------------------------------------

    #[tokio::test]
    async fn test_csv_row_count_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "food_type,amount\nlunch,2\nlunch,3\nstreet_meat,1\n").unwrap();

        // the fake server counts the rows of whatever was uploaded
        let uploaded: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut mock = MockTransport::new();
        let mut seq = Sequence::new();
        let store = uploaded.clone();
        mock.expect_send()
            .withf(|r| r.method == Method::Post && r.path == "/datasets")
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |r| {
                if let Some(file) = r.body.file("csv_file") {
                    *store.lock().unwrap() = file.bytes.clone();
                }
                ok(json!({"id": "abc"}))
            });
        let store = uploaded.clone();
        mock.expect_send()
            .withf(|r| r.path == "/datasets/abc" && r.query_param("count") == Some("true"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| {
                let text = String::from_utf8(store.lock().unwrap().clone()).unwrap();
                let rows = text.lines().skip(1).filter(|l| !l.is_empty()).count();
                ok(json!(rows))
            });

        let dataset = Dataset::create(&connection(mock), CreateOptions::new().path(file.path()))
            .await
            .unwrap();
        let count = dataset.get_data(&DataRequest::new().count(true)).await.unwrap();
        assert_eq!(count, DataResult::Count(3));
    }

    #[tokio::test]
    async fn test_get_data_with_select_query_and_limit() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| {
                let select: Value = serde_json::from_str(r.query_param("select").unwrap_or("null")).unwrap();
                let query: Value = serde_json::from_str(r.query_param("query").unwrap_or("null")).unwrap();
                r.method == Method::Get
                    && select == json!({"food_type": 1, "amount": 1})
                    && query == json!({"food_type": "lunch"})
                    && r.query_param("limit") == Some("7")
                    && r.query_param("index") == Some("true")
            })
            .times(1)
            .returning(|_| {
                ok(json!([
                    {"food_type": "lunch", "amount": 2.0, "index": 0},
                    {"food_type": "lunch", "amount": 4.0, "index": 3}
                ]))
            });

        let dataset = bound(mock);
        let request = DataRequest::new()
            .select(vec!["food_type", "amount"])
            .query(json!({"food_type": "lunch"}))
            .limit(7)
            .index(true);
        let rows = dataset.get_data(&request).await.unwrap().into_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].contains_key("index"));
    }

    #[tokio::test]
    async fn test_get_data_no_match_is_empty_not_error() {
        let mut mock = MockTransport::new();
        mock.expect_send().times(1).returning(|_| ok(json!([])));

        let result = bound(mock)
            .get_data(&DataRequest::new().query(json!({"k": "v"})))
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_get_data_rejects_malformed_arguments_locally() {
        let dataset = bound(MockTransport::new());

        for request in [
            DataRequest::new().query("not-a-mapping"),
            DataRequest::new().select("BAD"),
            DataRequest::new().format("BAD"),
            DataRequest::new().format("csv").count(true),
        ] {
            let err = dataset.get_data(&request).await.unwrap_err();
            assert!(err.is_validation(), "{:?} should be rejected", request);
        }
    }

    #[tokio::test]
    async fn test_get_data_csv_returns_text() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.query_param("format") == Some("csv"))
            .times(1)
            .returning(|_| Ok(Payload::Text("food_type,amount\nlunch,2\n".to_string())));

        let result = bound(mock)
            .get_data(&DataRequest::new().format("csv"))
            .await
            .unwrap();
        assert_eq!(result.csv(), Some("food_type,amount\nlunch,2\n"));
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn test_update_data() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| {
                let rows: Value = serde_json::from_str(r.body.field("update").unwrap_or("null")).unwrap();
                r.method == Method::Put && r.path == "/datasets/abc" && rows[0]["food_type"] == "morning_food"
            })
            .times(1)
            .returning(|_| ok(json!({"id": "abc"})));

        let dataset = bound(mock);
        let row = json!({
            "food_type": "morning_food",
            "amount": 10.0,
            "risk_factor": "high_risk",
            "rating": "delectible"
        });
        assert_ok!(dataset.update_data(&json!([row])).await);
    }

    #[tokio::test]
    async fn test_update_data_rejects_bad_rows() {
        let dataset = bound(MockTransport::new());
        for rows in [json!([]), json!({}), json!([[]]), json!([{"nested": {"a": 1}}])] {
            let err = dataset.update_data(&rows).await.unwrap_err();
            assert!(err.is_validation(), "{} should be rejected", rows);
        }
    }

    #[tokio::test]
    async fn test_row_operations() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Get && r.path == "/datasets/abc/row/0")
            .times(1)
            .returning(|_| ok(json!({"comments": "Try the yogurt drink"})));
        mock.expect_send()
            .withf(|r| r.method == Method::Put && r.path == "/datasets/abc/row/2" && r.body.field("data") == Some(r#"{"comments":"test"}"#))
            .times(1)
            .returning(|_| ok(json!({"success": "updated row"})));
        mock.expect_send()
            .withf(|r| r.method == Method::Delete && r.path == "/datasets/abc/row/10")
            .times(1)
            .returning(|_| ok(json!({"success": "deleted row"})));
        mock.expect_send()
            .withf(|r| r.method == Method::Get && r.path == "/datasets/abc/row/10")
            .times(1)
            .returning(|_| ok(json!({"error": "No row exists with index 10"})));

        let dataset = bound(mock);
        assert_eq!(dataset.get_row(0).await.unwrap()["comments"], "Try the yogurt drink");
        assert_ok!(dataset.update_row(2, &json!({"comments": "test"})).await);
        assert_ok!(dataset.delete_row(10).await);

        // a missing row is a data answer, not an error
        let missing = dataset.get_row(10).await.unwrap();
        assert!(missing.get("error").is_some());
    }

    // --- analytics ----------------------------------------------------------------

    #[tokio::test]
    async fn test_resample_and_rolling_pass_through() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| {
                r.path == "/datasets/abc/resample"
                    && r.query_param("date_column") == Some("submit_date")
                    && r.query_param("interval") == Some("D")
                    && r.query_param("how") == Some("sum")
                    && r.query_param("query").is_some()
            })
            .times(1)
            .returning(|_| ok(json!([{"submit_date": "2012-12-01", "amount": 12.0}])));
        mock.expect_send()
            .withf(|r| r.path == "/datasets/abc/rolling" && r.query_param("window") == Some("3"))
            .times(1)
            .returning(|_| ok(json!([{"amount": null}, {"amount": 3.0}])));

        let dataset = bound(mock);
        let resampled = dataset
            .resample("submit_date", "D", "sum", Some(&json!({"food_type": "street_meat"})))
            .await
            .unwrap();
        assert!(resampled.as_array().map(|a| !a.is_empty()).unwrap_or(false));

        let rolled = dataset.rolling("boxcar", 3, None).await.unwrap();
        assert!(rolled.is_array());
        assert!(dataset.rolling("boxcar", 0, None).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_summary_arguments_validated_independently() {
        let dataset = bound(MockTransport::new());
        for (select, query, groups) in [
            (Some(json!("BAD")), None, None),
            (None, Some(json!("BAD")), None),
            (None, None, Some(json!("BAD"))),
        ] {
            let err = dataset
                .get_summary(select.as_ref(), query.as_ref(), groups.as_ref())
                .await
                .unwrap_err();
            assert!(err.is_validation());
        }
    }

    #[tokio::test]
    async fn test_summary_request_shape() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.path == "/datasets/abc/summary" && r.query_param("select") == Some("all") && r.query_param("group") == Some("food_type"))
            .times(1)
            .returning(|_| ok(json!({"food_type": {"lunch": {"amount": {"summary": {"count": 7}}}}})));

        let summary = bound(mock)
            .get_summary(None, None, Some(&json!(["food_type"])))
            .await
            .unwrap();
        assert_eq!(summary.len(), 1);
        assert!(summary["food_type"].is_object());
    }

    #[tokio::test]
    async fn test_count_reads_summary() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.query_param("select") == Some(r#"{"food_type":1}"#))
            .times(1)
            .returning(|_| {
                ok(json!({"food_type": {"summary": {"lunch": 7, "dinner": 5, "street_meat": 7}}}))
            });
        mock.expect_send()
            .withf(|r| r.query_param("select") == Some(r#"{"amount":1}"#))
            .times(1)
            .returning(|_| ok(json!({"amount": {"summary": {"count": 19.0, "mean": 2.4}}})));

        let dataset = bound(mock);
        assert_eq!(dataset.count("food_type", "count").await.unwrap(), Some(19.0));
        assert_eq!(dataset.count("amount", "mean").await.unwrap(), Some(2.4));
    }

    // --- calculations -------------------------------------------------------------

    #[tokio::test]
    async fn test_add_calculation_accepted_and_rejected() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Post && r.path == "/calculations/abc" && r.body.field("formula") == Some("amount * 2"))
            .times(1)
            .returning(|_| ok(json!({"success": "created calculation: double_amount", "id": "abc"})));
        mock.expect_send()
            .withf(|r| r.body.field("formula") == Some("BAD"))
            .times(1)
            .returning(|_| ok(json!({"error": "Parse Failure"})));

        let dataset = bound(mock);
        assert!(dataset.add_calculation("double_amount", "amount * 2", None).await.unwrap());
        assert!(!dataset.add_calculation("double_amount", "BAD", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_calculation_with_groups() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.body.field("group") == Some("food_type,rating"))
            .times(1)
            .returning(|_| ok(json!({"success": "created calculation: sum_amount"})));

        let dataset = bound(mock);
        let accepted = dataset
            .add_calculation("sum_amount", "sum(amount)", Some(&json!(["food_type", "rating"])))
            .await
            .unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn test_add_calculation_invalid_groups_always_fail() {
        let dataset = bound(MockTransport::new());
        for groups in [json!("BAD"), json!(3), json!([1, 2]), json!({"food_type": 1})] {
            for formula in ["sum(amount)", "BAD"] {
                let err = dataset
                    .add_calculation("sum_amount", formula, Some(&groups))
                    .await
                    .unwrap_err();
                assert!(err.is_validation());
            }
        }
        assert!(dataset.add_calculation("", "ok", None).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_add_calculations_batch() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| {
                let uploaded = r
                    .body
                    .file("json_file")
                    .and_then(|f| serde_json::from_slice::<Value>(&f.bytes).ok());
                r.path == "/calculations/abc" && uploaded.map(|v| v.as_array().map(|a| a.len())) == Some(Some(2))
            })
            .times(1)
            .returning(|_| ok(json!({"success": "created calculations"})));

        let dataset = bound(mock);
        let formulae = json!([
            {"name": "double_amount", "formula": "amount * 2"},
            {"name": "triple_amount", "formula": "amount * 3"}
        ]);
        assert!(dataset.add_calculations(&formulae).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_calculations_rejects_bad_batches() {
        let dataset = bound(MockTransport::new());
        for batch in [
            json!([]),
            json!("double_amount"),
            json!([{"name": "number", "formula": 3}]),
            json!([
                {"name": "sum_amount", "formula": "sum(amount)", "groups": ["food_type"]},
                {"name": "sum_amount", "formula": "max(amount)", "groups": ["food_type"]}
            ]),
        ] {
            let err = dataset.add_calculations(&batch).await.unwrap_err();
            assert!(err.is_validation(), "{} should be rejected", batch);
        }
    }

    #[tokio::test]
    async fn test_same_name_in_different_groups_is_allowed() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| ok(json!({"success": "created calculations"})));

        let batch = json!([
            {"name": "sum_amount", "formula": "sum(amount)", "groups": ["food_type"]},
            {"name": "sum_amount", "formula": "sum(amount)", "groups": ["food_type", "rating"]}
        ]);
        assert!(bound(mock).add_calculations(&batch).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_calculation() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Delete && r.query_param("name") == Some("double_amount"))
            .times(1)
            .returning(|_| ok(json!({"success": "deleted calculation: double_amount"})));
        mock.expect_send()
            .withf(|r| r.query_param("name") == Some("bad"))
            .times(1)
            .returning(|_| ok(json!({"error": "name bad not found"})));

        let dataset = bound(mock);
        assert!(dataset.remove_calculation("double_amount").await.unwrap());
        assert!(!dataset.remove_calculation("bad").await.unwrap());
    }

    #[tokio::test]
    async fn test_formula_failure_surfaces_on_next_state_check() {
        let mut mock = MockTransport::new();
        let mut seq = Sequence::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Post)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(json!({"success": "created calculation: ratio"})));
        mock.expect_send()
            .withf(|r| r.method == Method::Get && r.path == "/calculations/abc")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                ok(json!([
                    {"name": "ratio", "formula": "amount / missing", "group": null, "state": "failed"}
                ]))
            });

        let dataset = bound(mock);
        assert!(dataset.add_calculation("ratio", "amount / missing", None).await.unwrap());
        assert!(!dataset.calculation_succeeded("ratio").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_calculations_reports_each_state() {
        let mut mock = MockTransport::new();
        let mut seq = Sequence::new();
        mock.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(json!([{"name": "double_amount", "formula": "amount * 2", "group": null, "state": "pending"}])));
        mock.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(json!([{"name": "double_amount", "formula": "amount * 2", "group": null, "state": "ready"}])));

        let dataset = bound(mock);
        let calcs = dataset.get_calculations().await.unwrap();
        assert_eq!(calcs.len(), 1);
        assert_eq!(calcs[0].state, ResourceState::Pending);

        let mut watch = dataset.calculation("double_amount");
        let policy = PollPolicy {
            interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(5),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(poll::wait_until_settled(&mut watch, policy).await.unwrap(), ResourceState::Ready);
    }

    #[tokio::test]
    async fn test_aggregate_datasets_are_discovered_per_call() {
        let mut mock = MockTransport::new();
        let mut seq = Sequence::new();
        mock.expect_send()
            .withf(|r| r.path == "/datasets/abc/aggregations")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(json!({})));
        mock.expect_send()
            .withf(|r| r.path == "/datasets/abc/aggregations")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok(json!({"": "agg-all", "food_type": "agg-food"})));

        let dataset = bound(mock);
        assert!(dataset.get_aggregate_datasets().await.unwrap().is_empty());

        let aggregations = dataset.get_aggregate_datasets().await.unwrap();
        assert_eq!(aggregations.len(), 2);
        assert_eq!(aggregations[&GroupSignature::none()].id(), Some("agg-all"));
        let by_food = &aggregations[&GroupSignature::from_columns(["food_type"])];
        assert_eq!(by_food.id(), Some("agg-food"));
    }

    // --- merge and join -------------------------------------------------------------

    #[tokio::test]
    async fn test_merge() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.path == "/datasets/merge" && r.body == RequestBody::Form(vec![("datasets".into(), r#"["abc","def"]"#.into())]))
            .times(1)
            .returning(|_| ok(json!({"id": "merged"})));

        let connection = connection(mock);
        let a = Dataset::attach(&connection, "abc");
        let b = Dataset::attach(&connection, "def");
        let merged = merge(&[&a, &b], Some(&connection)).await.unwrap().unwrap();
        assert_eq!(merged.id(), Some("merged"));
    }

    #[tokio::test]
    async fn test_merge_rejected_is_none() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| ok(json!({"error": "datasets have incompatible schemas"})));

        let connection = connection(mock);
        let a = Dataset::attach(&connection, "abc");
        let b = Dataset::attach(&connection, "12345");
        assert!(merge(&[&a, &b], Some(&connection)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_validation() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Delete)
            .times(1)
            .returning(|_| ok(json!({"success": "deleted dataset"})));

        let connection = connection(mock);
        let a = Dataset::attach(&connection, "abc");
        let mut gone = Dataset::attach(&connection, "def");
        gone.delete().await.unwrap();

        assert!(merge(&[&a], Some(&connection)).await.unwrap_err().is_validation());
        assert!(merge(&[&a, &gone], Some(&connection)).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_join() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| {
                r.path == "/datasets/join"
                    && r.body.field("dataset_id") == Some("abc")
                    && r.body.field("other_dataset_id") == Some("aux")
                    && r.body.field("on") == Some("food_type")
            })
            .times(1)
            .returning(|_| ok(json!({"id": "joined"})));
        mock.expect_send()
            .withf(|r| r.body.field("on") == Some("BAD"))
            .times(1)
            .returning(|_| ok(json!({"error": "right hand side has no column BAD"})));

        let connection = connection(mock);
        let left = Dataset::attach(&connection, "abc");
        let right = Dataset::attach(&connection, "aux");

        let joined = join(&left, &right, "food_type", Some(&connection)).await.unwrap();
        assert_eq!(joined.and_then(|d| d.id().map(str::to_string)), Some("joined".to_string()));

        assert!(join(&left, &right, "BAD", Some(&connection)).await.unwrap().is_none());
        assert!(join(&left, &right, "", Some(&connection)).await.unwrap_err().is_validation());
    }

    // --- refusals by status -----------------------------------------------------

    fn refused(message: &'static str) -> impl Fn(ApiRequest) -> Result<Payload> + Send + 'static {
        move |_| Err(Error::remote(Some(400), message))
    }

    #[tokio::test]
    async fn test_client_error_status_is_a_normal_negative() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|r| r.method == Method::Post && r.body.field("formula") == Some("BAD"))
            .times(1)
            .returning(refused("Parse Failure"));
        mock.expect_send()
            .withf(|r| r.method == Method::Post && r.body.file("json_file").is_some())
            .times(1)
            .returning(refused("calculation name already exists"));
        mock.expect_send()
            .withf(|r| r.method == Method::Delete && r.query_param("name") == Some("bad"))
            .times(1)
            .returning(refused("name bad not found"));
        mock.expect_send()
            .withf(|r| r.path == "/datasets/merge")
            .times(1)
            .returning(refused("datasets have incompatible schemas"));
        mock.expect_send()
            .withf(|r| r.path == "/datasets/join")
            .times(1)
            .returning(|_| Err(Error::remote(Some(404), "right hand side has no column BAD")));

        let connection = connection(mock);
        let dataset = Dataset::attach(&connection, "abc");
        let other = Dataset::attach(&connection, "12345");

        assert!(!dataset.add_calculation("double_amount", "BAD", None).await.unwrap());
        let batch = json!([{"name": "double_amount", "formula": "amount * 2"}]);
        assert!(!dataset.add_calculations(&batch).await.unwrap());
        assert!(!dataset.remove_calculation("bad").await.unwrap());
        assert!(merge(&[&dataset, &other], Some(&connection)).await.unwrap().is_none());
        assert!(join(&dataset, &other, "BAD", Some(&connection)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_fault_is_not_a_negative() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(3)
            .returning(|_| Err(Error::remote(Some(500), "internal error")));

        let connection = connection(mock);
        let dataset = Dataset::attach(&connection, "abc");
        let other = Dataset::attach(&connection, "def");

        let err = dataset.remove_calculation("bad").await.unwrap_err();
        assert!(matches!(err, Error::Remote { status: Some(500), .. }));
        assert!(dataset.add_calculation("double_amount", "amount * 2", None).await.unwrap_err().is_remote());
        assert!(merge(&[&dataset, &other], Some(&connection)).await.unwrap_err().is_remote());
    }

    #[tokio::test]
    async fn test_client_error_outside_negative_operations_is_an_error() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(1)
            .returning(refused("dataset not found"));

        let mut dataset = bound(mock);
        let err = dataset.get_info().await.unwrap_err();
        assert!(err.is_refusal());
    }
}
