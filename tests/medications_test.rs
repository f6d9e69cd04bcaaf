use std::collections::BTreeSet;

use dose_buddy::allocator::ChamberPool;
use dose_buddy::db;
use dose_buddy::error::DoseError;
use dose_buddy::medications::MedicationService;
use dose_buddy::store::Store;
use dose_buddy::validation::MedicationForm;

async fn setup_service() -> MedicationService {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    MedicationService::new(Store::new(pool, ChamberPool::default()))
}

fn form(name: &str, hour: &str) -> MedicationForm {
    MedicationForm {
        name: Some(name.into()),
        pills: Some("1".into()),
        hour: Some(hour.into()),
        minute: Some("0".into()),
        from_date: Some("2024-01-01".into()),
        to_date: Some("2024-01-10".into()),
        conditions: None,
    }
}

#[tokio::test]
async fn add_fills_lowest_free_chamber() {
    let service = setup_service().await;
    assert_eq!(service.next_chamber().await.unwrap(), 1);

    let a = service.add_medication(&form("A", "8")).await.unwrap();
    let b = service.add_medication(&form("B", "9")).await.unwrap();
    let c = service.add_medication(&form("C", "10")).await.unwrap();
    assert_eq!((a.chamber, b.chamber, c.chamber), (1, 2, 3));
    assert!(!a.dispensed);
    assert!(a.last_dispensed.is_none());

    // Deleting chamber 2 makes it the next one handed out.
    service.delete_medication(&b.id).await.unwrap();
    assert_eq!(
        service.available_chambers().await.unwrap(),
        BTreeSet::from([2, 4])
    );
    let d = service.add_medication(&form("D", "11")).await.unwrap();
    assert_eq!(d.chamber, 2);
}

#[tokio::test]
async fn add_without_capacity_writes_nothing() {
    let service = setup_service().await;
    for i in 0..4 {
        service
            .add_medication(&form(&format!("M{}", i), "8"))
            .await
            .unwrap();
    }
    assert!(service.available_chambers().await.unwrap().is_empty());
    assert!(matches!(service.next_chamber().await, Err(DoseError::NoCapacity)));

    let err = service.add_medication(&form("Extra", "9")).await.unwrap_err();
    assert!(matches!(err, DoseError::NoCapacity));
    assert_eq!(service.list().await.unwrap().len(), 4);
}

#[tokio::test]
async fn invalid_form_writes_nothing() {
    let service = setup_service().await;
    let mut bad = form("A", "8");
    bad.pills = Some("0".into());
    assert!(matches!(
        service.add_medication(&bad).await,
        Err(DoseError::Validation(_))
    ));
    assert!(service.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn batch_drops_incomplete_rows() {
    let service = setup_service().await;
    let partial = MedicationForm {
        name: Some("Half".into()),
        pills: Some("1".into()),
        ..Default::default()
    };
    let rows = vec![
        form("A", "8"),
        partial,
        MedicationForm::default(),
        form("B", "20"),
    ];

    let outcome = service.submit_batch(&rows).await.unwrap();
    assert_eq!(outcome.dropped, 1);
    let names: Vec<_> = outcome.saved.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
    let chambers: Vec<_> = outcome.saved.iter().map(|r| r.chamber).collect();
    assert_eq!(chambers, vec![1, 2]);
}

#[tokio::test]
async fn batch_with_no_data_is_rejected() {
    let service = setup_service().await;
    let rows = vec![
        MedicationForm::default(),
        MedicationForm {
            conditions: Some("with food".into()),
            ..Default::default()
        },
    ];
    let err = service.submit_batch(&rows).await.unwrap_err();
    assert!(matches!(err, DoseError::Validation(msg) if msg.contains("at least one")));
}

#[tokio::test]
async fn batch_is_all_or_nothing() {
    let service = setup_service().await;
    service.add_medication(&form("A", "8")).await.unwrap();
    service.add_medication(&form("B", "9")).await.unwrap();

    let rows: Vec<_> = (0..3).map(|i| form(&format!("N{}", i), "12")).collect();
    let err = service.submit_batch(&rows).await.unwrap_err();
    assert!(matches!(err, DoseError::NoCapacity));
    assert_eq!(service.list().await.unwrap().len(), 2);

    // A batch with one invalid complete row saves nothing either.
    let mut bad = form("Bad", "12");
    bad.hour = Some("25".into());
    let err = service
        .submit_batch(&[form("Good", "12"), bad])
        .await
        .unwrap_err();
    assert!(matches!(err, DoseError::Validation(_)));
    assert_eq!(service.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn update_keeps_chambers_unique() {
    let service = setup_service().await;
    let a = service.add_medication(&form("A", "8")).await.unwrap();
    let b = service.add_medication(&form("B", "9")).await.unwrap();

    let mut moved = b.clone();
    moved.chamber = a.chamber;
    assert!(matches!(
        service.update_medication(&moved).await,
        Err(DoseError::ChamberTaken(1))
    ));

    let mut outside = b.clone();
    outside.chamber = 5;
    assert!(matches!(
        service.update_medication(&outside).await,
        Err(DoseError::Validation(_))
    ));

    let mut free = b.clone();
    free.chamber = 4;
    free.pills = 3;
    service.update_medication(&free).await.unwrap();

    let stored = service.store().medication(&b.id).await.unwrap().unwrap();
    assert_eq!((stored.chamber, stored.pills), (4, 3));
    assert_eq!(service.next_chamber().await.unwrap(), 2);
}

#[tokio::test]
async fn update_and_delete_of_missing_medication() {
    let service = setup_service().await;
    let a = service.add_medication(&form("A", "8")).await.unwrap();
    service.delete_medication(&a.id).await.unwrap();

    assert!(matches!(
        service.update_medication(&a).await,
        Err(DoseError::NotFound(id)) if id == a.id
    ));
    assert!(matches!(
        service.delete_medication(&a.id).await,
        Err(DoseError::NotFound(_))
    ));
    assert!(service.list().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adds_get_distinct_chambers() {
    let td = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", td.path().join("dose.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let service = MedicationService::new(Store::new(pool, ChamberPool::default()));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .add_medication(&form(&format!("M{}", i), "8"))
                    .await
            })
        })
        .collect();

    let mut chambers = BTreeSet::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(record) => assert!(chambers.insert(record.chamber), "duplicate chamber"),
            Err(DoseError::NoCapacity) => rejected += 1,
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(chambers, BTreeSet::from([1, 2, 3, 4]));
    assert_eq!(rejected, 2);
    assert_eq!(service.list().await.unwrap().len(), 4);
}
