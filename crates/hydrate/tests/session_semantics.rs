mod common;

use asupersync::runtime::RuntimeBuilder;
use hydrate::prelude::*;
use hydrate::{
    EntityStatus, FetchMode, FetchProfile, IntegrityErrorKind, LoadOutcome, LoadRequest, LoadType,
    QueryErrorKind,
};

use common::{
    ScriptedConnection, animal_factory, animal_row, expect_err, factory_with, joined_team_factory,
    people_factory, people_metamodel, person_row, person_with_team_row, team_member_row,
    team_members_factory, unwrap_outcome,
};

#[test]
fn translated_errors_name_the_entity_and_release_the_statement() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn =
            ScriptedConnection::new().fail_on("from people", "deadlock detected", Some("40P01"));
        let factory = people_factory(1, BatchFetchStyle::Padded);
        let mut session = factory.open_session(conn.clone());

        let err = expect_err(session.load(&cx, "Person", 42_i64).await);
        let Error::Query(query) = &err else {
            panic!("expected a query error, got {err:?}");
        };
        assert_eq!(query.kind, QueryErrorKind::Deadlock);
        assert_eq!(query.message, "could not load an entity: [Person#42]");
        assert_eq!(query.detail.as_deref(), Some("deadlock detected"));
        assert!(query.sql.as_deref().is_some_and(|sql| sql.contains("from people")));
        assert!(err.is_retryable());
        assert_eq!(conn.open_statements(), 0);
        assert!(session.persistence_context().is_empty());
    });
}

#[test]
fn batch_errors_describe_every_key() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().fail_on("from people", "boom", None);
        let factory = people_factory(10, BatchFetchStyle::Dynamic);
        let mut session = factory.open_session(conn.clone());
        for id in 1..=3_i64 {
            session.register_proxy("Person", id).expect("proxy");
        }

        let err = expect_err(session.load(&cx, "Person", 2_i64).await);
        let Error::Query(query) = &err else {
            panic!("expected a query error, got {err:?}");
        };
        assert_eq!(query.message, "could not load an entity batch: [Person#<2, 1, 3>]");
        assert_eq!(conn.open_statements(), 0);
    });
}

#[test]
fn duplicate_rows_for_one_identifier_are_rejected() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().rows(
            "from people",
            vec![person_row(42, "Ada", None), person_row(42, "Ada", None)],
        );
        let factory = people_factory(1, BatchFetchStyle::Padded);
        let mut session = factory.open_session(conn);

        let err = expect_err(session.load(&cx, "Person", 42_i64).await);
        assert_eq!(err.integrity_kind(), Some(IntegrityErrorKind::NonUniqueResult));
    });
}

#[test]
fn joined_collections_repeat_the_owner_without_error() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().rows(
            "from teams",
            vec![
                team_member_row(1, "Engines", 10, "Ada"),
                team_member_row(1, "Engines", 11, "Charles"),
            ],
        );
        let factory = team_members_factory();
        let mut session = factory.open_session(conn.clone());

        let team = unwrap_outcome(session.load(&cx, "Team", 1_i64).await);
        let members = team.collection(1).expect("members fetched");
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(EntityRef::is_initialized));
        assert_eq!(members[1].basic(0), Some(Value::Text("Charles".to_string())));

        let (sql, _) = conn.last_statement();
        assert!(sql.contains(" left outer join members members1_ on team0_.id=members1_.team_id"), "{sql}");
        assert_eq!(conn.statement_count(), 1);
    });
}

#[test]
fn join_fetched_references_arrive_initialized() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().rows(
            "from people",
            vec![person_with_team_row(1, "Ada", 7, "Engines")],
        );
        let factory = joined_team_factory();
        let mut session = factory.open_session(conn.clone());

        let person = unwrap_outcome(session.load(&cx, "Person", 1_i64).await);
        let team = person.to_one(1).expect("team");
        assert!(team.is_initialized());
        assert_eq!(team.basic(0), Some(Value::Text("Engines".to_string())));

        // The team is now managed too.
        let again = unwrap_outcome(session.load(&cx, "Team", 7_i64).await);
        assert!(again.same(&team));
        assert_eq!(conn.statement_count(), 1);
    });
}

#[test]
fn fetch_profiles_turn_selects_into_joins() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().rows(
            "from people",
            vec![person_with_team_row(1, "Ada", 7, "Engines")],
        );
        let metamodel = Metamodel::builder()
            .entity(
                EntityPersister::builder("Person", "people")
                    .property(PropertyMapping::basic("name", "name"))
                    .property(
                        PropertyMapping::many_to_one("team", "Team", &["team_id"])
                            .fetch(FetchMode::Select),
                    ),
            )
            .entity(
                EntityPersister::builder("Team", "teams")
                    .property(PropertyMapping::basic("name", "name")),
            )
            .fetch_profile(FetchProfile::new("with-team").join("Person", "team"))
            .build()
            .expect("valid mapping");
        let factory = factory_with(metamodel, Settings::new());
        let mut session = factory.open_session(conn.clone());

        let err = session.enable_fetch_profile("nope").expect_err("unknown profile");
        assert!(err.mapping_kind().is_some());

        session.enable_fetch_profile("with-team").expect("known profile");
        let person = unwrap_outcome(session.load(&cx, "Person", 1_i64).await);
        assert!(person.to_one(1).expect("team").is_initialized());

        let (sql, _) = conn.last_statement();
        assert!(sql.contains(" join teams team1_ on person0_.team_id=team1_.id"), "{sql}");
    });
}

#[test]
fn subclass_loads_check_the_managed_class() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().rows(
            "from animals dog0_",
            vec![animal_row("dog0_", 1, "Rex", "D")],
        );
        let factory = animal_factory();
        let mut session = factory.open_session(conn.clone());

        let dog = unwrap_outcome(session.load(&cx, "Dog", 1_i64).await);
        assert_eq!(dog.entity_name(), "Dog");
        let (sql, _) = conn.last_statement();
        assert!(sql.ends_with(" where dog0_.id = $1 and dog0_.kind in ('D')"), "{sql}");

        // The superclass resolves to the managed subclass instance.
        let animal = unwrap_outcome(session.load(&cx, "Animal", 1_i64).await);
        assert!(animal.same(&dog));

        let err = expect_err(session.load(&cx, "Cat", 1_i64).await);
        assert_eq!(err.integrity_kind(), Some(IntegrityErrorKind::WrongClass));

        let outcome = unwrap_outcome(
            session
                .load_outcome(&cx, &LoadRequest::new("Cat", 1_i64), LoadType::GET)
                .await,
        );
        assert!(matches!(outcome, LoadOutcome::Inconsistent(_)));
        assert_eq!(conn.statement_count(), 1);
    });
}

#[test]
fn deleted_entities_hide_from_get_but_not_from_internal_loads() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().table(
            "from people",
            "person0__id",
            vec![person_row(1, "Ada", None)],
        );
        let factory = factory_with(people_metamodel(1), Settings::new());
        let mut session = factory.open_session(conn.clone());
        let ada = unwrap_outcome(session.load(&cx, "Person", 1_i64).await);

        session.delete_local(&ada).expect("managed");
        assert_eq!(session.entity_status(&ada), Some(EntityStatus::Deleted));
        assert!(unwrap_outcome(session.get(&cx, "Person", 1_i64).await).is_none());

        let request = LoadRequest::new("Person", 1_i64);
        let outcome = unwrap_outcome(
            session
                .load_outcome(&cx, &request, LoadType::INTERNAL_LOAD_EAGER)
                .await,
        );
        assert!(outcome.entity().is_some_and(|e| e.same(&ada)));
        assert_eq!(conn.statement_count(), 1);
    });
}

#[test]
fn evicted_entities_reload_as_new_instances() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().table(
            "from people",
            "person0__id",
            vec![person_row(1, "Ada", None)],
        );
        let factory = factory_with(people_metamodel(1), Settings::new());
        let mut session = factory.open_session(conn.clone());
        let first = unwrap_outcome(session.load(&cx, "Person", 1_i64).await);

        session.evict(&first).expect("managed");
        assert!(!session.contains(&first));

        let second = unwrap_outcome(session.load(&cx, "Person", 1_i64).await);
        assert!(!second.same(&first));
        assert!(second.attributes_equal(&first));
        assert_eq!(conn.statement_count(), 2);
    });
}

#[test]
fn natural_keys_load_through_the_unique_key_loader() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().table(
            "from people",
            "person0__name",
            vec![person_row(1, "Ada", None), person_row(2, "Grace", None)],
        );
        let factory = factory_with(people_metamodel(1), Settings::new());
        let mut session = factory.open_session(conn.clone());

        let grace = unwrap_outcome(session.find_by_natural_key(&cx, "Person", "name", "Grace").await)
            .expect("row exists");
        assert_eq!(grace.identifier(), &Identifier::from(2_i64));
        let (sql, _) = conn.last_statement();
        assert!(sql.ends_with(" where person0_.name = $1"), "{sql}");

        // The identity map now answers by identifier.
        let by_id = unwrap_outcome(session.load(&cx, "Person", 2_i64).await);
        assert!(by_id.same(&grace));

        let missing =
            unwrap_outcome(session.find_by_natural_key(&cx, "Person", "name", "Linus").await);
        assert!(missing.is_none());
        assert_eq!(conn.statement_count(), 2);
    });
}

#[test]
fn read_only_sessions_mark_loaded_entities() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = ScriptedConnection::new().table(
            "from people",
            "person0__id",
            vec![person_row(1, "Ada", None)],
        );
        let factory = factory_with(people_metamodel(1), Settings::new());
        let mut session =
            factory.open_session_with(conn, SessionConfig::new().default_read_only(true));
        let ada = unwrap_outcome(session.load(&cx, "Person", 1_i64).await);
        assert_eq!(session.entity_status(&ada), Some(EntityStatus::ReadOnly));
    });
}
