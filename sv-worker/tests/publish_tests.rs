//! Publishing: the markdown handler end to end, index generation from the
//! database, and build-job coalescing through the handler path.

mod common;

use common::{insert_seed_article, make_ctx, setup_pool};
use serde_json::json;
use sv_worker::db::articles;
use sv_worker::publish::WriteArticleMarkdownHandler;
use sv_worker::queue::job_types;
use sv_worker::worker::JobHandler;
use tempfile::TempDir;

#[tokio::test]
async fn markdown_handler_writes_file_and_records_path() {
    let pool = setup_pool().await;
    insert_seed_article(&pool, "a1", "s1", "Important Advisory").await;

    let site = TempDir::new().unwrap();
    let mut config = common::default_config();
    config.paths.site_src_dir = site.path().to_string_lossy().into_owned();

    let (ctx, _cancel) = make_ctx(
        &pool,
        config,
        job_types::WRITE_ARTICLE_MARKDOWN,
        json!({ "article_id": "a1", "source_id": "s1" }),
    );
    let result = WriteArticleMarkdownHandler.run(&ctx).await.unwrap();

    let path = result["path"].as_str().unwrap();
    assert!(path.contains("content/posts/"));
    let content = std::fs::read_to_string(path).unwrap();
    assert!(content.contains("Important Advisory"));

    let article = articles::get_article(&pool, "a1").await.unwrap().unwrap();
    assert_eq!(article.published_md_path.as_deref(), Some(path));

    // The handler also refreshed the article index.
    let index = site.path().join("static").join("index").join("articles.json");
    assert!(index.exists());
    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(index).unwrap()).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_markdown_writes_coalesce_into_one_build() {
    let pool = setup_pool().await;
    let site = TempDir::new().unwrap();
    let mut config = common::default_config();
    config.paths.site_src_dir = site.path().to_string_lossy().into_owned();

    for article_id in ["a1", "a2", "a3"] {
        insert_seed_article(&pool, article_id, "s1", "Story").await;
        let (ctx, _cancel) = make_ctx(
            &pool,
            config.clone(),
            job_types::WRITE_ARTICLE_MARKDOWN,
            json!({ "article_id": article_id, "source_id": "s1" }),
        );
        WriteArticleMarkdownHandler.run(&ctx).await.unwrap();
    }

    assert_eq!(
        common::count_jobs_of_type(&pool, job_types::BUILD_SITE).await,
        1,
        "three writers in one window produce one build job"
    );
}

#[tokio::test]
async fn missing_article_is_a_not_found_error() {
    let pool = setup_pool().await;
    let (ctx, _cancel) = make_ctx(
        &pool,
        common::default_config(),
        job_types::WRITE_ARTICLE_MARKDOWN,
        json!({ "article_id": "nope", "source_id": "s1" }),
    );
    let err = WriteArticleMarkdownHandler.run(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), sv_common::ErrorKind::NotFound);
}
