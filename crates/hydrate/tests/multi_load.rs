mod common;

use asupersync::runtime::RuntimeBuilder;
use hydrate::prelude::*;

use common::{ScriptedConnection, factory_with, ids, people_metamodel, person_row, unwrap_outcome};

fn connection() -> ScriptedConnection {
    ScriptedConnection::new().table(
        "from people",
        "person0__id",
        vec![
            person_row(1, "Ada", None),
            person_row(2, "Grace", None),
            person_row(3, "Barbara", None),
        ],
    )
}

fn identifier_of(entity: Option<&EntityRef>) -> Option<Identifier> {
    entity.map(|e| e.identifier().clone())
}

#[test]
fn ordered_results_line_up_with_the_request() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = connection();
        let factory = factory_with(people_metamodel(1), Settings::new());
        let mut session = factory.open_session(conn.clone());

        let results = unwrap_outcome(
            session
                .multi_load(&cx, "Person", &ids(&[3, 99, 1]), &MultiLoadOptions::new())
                .await,
        );
        assert_eq!(results.len(), 3);
        assert_eq!(identifier_of(results[0].as_ref()), Some(Identifier::from(3_i64)));
        assert!(results[1].is_none());
        assert_eq!(identifier_of(results[2].as_ref()), Some(Identifier::from(1_i64)));

        assert_eq!(conn.statement_count(), 1);
        let (sql, _) = conn.last_statement();
        assert!(sql.contains(" in ($1, $2, $3)"), "{sql}");
    });
}

#[test]
fn unordered_results_hold_only_what_was_found() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let factory = factory_with(people_metamodel(1), Settings::new());
        let mut session = factory.open_session(connection());

        let results = unwrap_outcome(
            session
                .multi_load(
                    &cx,
                    "Person",
                    &ids(&[3, 99, 1]),
                    &MultiLoadOptions::new().ordered(false),
                )
                .await,
        );
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Option::is_some));
    });
}

#[test]
fn explicit_batch_size_splits_statements() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = connection();
        let factory = factory_with(people_metamodel(1), Settings::new());
        let mut session = factory.open_session(conn.clone());

        let results = unwrap_outcome(
            session
                .multi_load(
                    &cx,
                    "Person",
                    &ids(&[1, 2, 3]),
                    &MultiLoadOptions::new().batch_size(2),
                )
                .await,
        );
        assert!(results.iter().all(Option::is_some));

        let statements = conn.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].1.len(), 2);
        assert_eq!(statements[1].1.len(), 1);
    });
}

#[test]
fn session_checking_answers_from_the_identity_map() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = connection();
        let factory = factory_with(people_metamodel(1), Settings::new());
        let mut session = factory.open_session(conn.clone());
        let ada = unwrap_outcome(session.load(&cx, "Person", 1_i64).await);
        let grace = unwrap_outcome(session.load(&cx, "Person", 2_i64).await);
        assert_eq!(conn.statement_count(), 2);

        let options = MultiLoadOptions::new().session_checking(true);
        let results = unwrap_outcome(
            session
                .multi_load(&cx, "Person", &ids(&[2, 1]), &options)
                .await,
        );
        assert!(results[0].as_ref().is_some_and(|e| e.same(&grace)));
        assert!(results[1].as_ref().is_some_and(|e| e.same(&ada)));
        assert_eq!(conn.statement_count(), 2);
    });
}

#[test]
fn deleted_entities_are_returned_only_on_request() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = connection();
        let factory = factory_with(people_metamodel(1), Settings::new());
        let mut session = factory.open_session(conn.clone());
        let ada = unwrap_outcome(session.load(&cx, "Person", 1_i64).await);
        session.delete_local(&ada).expect("managed");

        let hidden = unwrap_outcome(
            session
                .multi_load(
                    &cx,
                    "Person",
                    &ids(&[1]),
                    &MultiLoadOptions::new().session_checking(true),
                )
                .await,
        );
        assert!(hidden[0].is_none());

        let shown = unwrap_outcome(
            session
                .multi_load(
                    &cx,
                    "Person",
                    &ids(&[1]),
                    &MultiLoadOptions::new()
                        .session_checking(true)
                        .return_deleted(true),
                )
                .await,
        );
        assert!(shown[0].as_ref().is_some_and(|e| e.same(&ada)));

        // Without session checking a pending delete still hides the row.
        let unchecked = unwrap_outcome(
            session
                .multi_load(&cx, "Person", &ids(&[1]), &MultiLoadOptions::new())
                .await,
        );
        assert!(unchecked[0].is_none());
        assert_eq!(conn.statement_count(), 1);
    });
}
