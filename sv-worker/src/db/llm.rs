//! LLM registry and run journal
//!
//! Providers, models, prompts, and profiles are operator-managed rows; a
//! stage route binds a pipeline stage name to the profile that serves it.

use sqlx::SqlitePool;
use sv_common::models::{LlmParams, LlmRun};
use sv_common::Result;

#[derive(Debug, Clone)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub base_url: Option<String>,
    pub api_key_cipher: Option<String>,
    pub api_key_key_id: Option<String>,
    pub timeout_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct Model {
    pub id: String,
    pub provider_id: String,
    pub model_name: String,
}

#[derive(Debug, Clone)]
pub struct Prompt {
    pub id: String,
    pub name: String,
    pub system_template: String,
    pub user_template: String,
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    pub model_id: String,
    pub prompt_id: String,
    pub params: LlmParams,
    pub enabled: bool,
}

pub async fn get_provider(pool: &SqlitePool, provider_id: &str) -> Result<Option<Provider>> {
    let row: Option<(String, String, Option<String>, Option<String>, Option<String>, i64)> =
        sqlx::query_as(
            "SELECT id, name, base_url, api_key_cipher, api_key_key_id, timeout_seconds
             FROM llm_providers WHERE id = ?",
        )
        .bind(provider_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(id, name, base_url, api_key_cipher, api_key_key_id, timeout_seconds)| Provider {
        id,
        name,
        base_url,
        api_key_cipher,
        api_key_key_id,
        timeout_seconds,
    }))
}

pub async fn upsert_provider(pool: &SqlitePool, provider: &Provider) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO llm_providers (id, name, base_url, api_key_cipher, api_key_key_id, timeout_seconds)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            base_url = excluded.base_url,
            api_key_cipher = COALESCE(excluded.api_key_cipher, llm_providers.api_key_cipher),
            api_key_key_id = COALESCE(excluded.api_key_key_id, llm_providers.api_key_key_id),
            timeout_seconds = excluded.timeout_seconds
        "#,
    )
    .bind(&provider.id)
    .bind(&provider.name)
    .bind(&provider.base_url)
    .bind(&provider.api_key_cipher)
    .bind(&provider.api_key_key_id)
    .bind(provider.timeout_seconds)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_model(pool: &SqlitePool, model_id: &str) -> Result<Option<Model>> {
    let row: Option<(String, String, String)> =
        sqlx::query_as("SELECT id, provider_id, model_name FROM llm_models WHERE id = ?")
            .bind(model_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(id, provider_id, model_name)| Model {
        id,
        provider_id,
        model_name,
    }))
}

pub async fn upsert_model(pool: &SqlitePool, model: &Model) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO llm_models (id, provider_id, model_name)
        VALUES (?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            provider_id = excluded.provider_id,
            model_name = excluded.model_name
        "#,
    )
    .bind(&model.id)
    .bind(&model.provider_id)
    .bind(&model.model_name)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_prompt(pool: &SqlitePool, prompt_id: &str) -> Result<Option<Prompt>> {
    let row: Option<(String, String, String, String)> = sqlx::query_as(
        "SELECT id, name, system_template, user_template FROM llm_prompts WHERE id = ?",
    )
    .bind(prompt_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id, name, system_template, user_template)| Prompt {
        id,
        name,
        system_template,
        user_template,
    }))
}

pub async fn upsert_prompt(pool: &SqlitePool, prompt: &Prompt) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO llm_prompts (id, name, system_template, user_template)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            system_template = excluded.system_template,
            user_template = excluded.user_template
        "#,
    )
    .bind(&prompt.id)
    .bind(&prompt.name)
    .bind(&prompt.system_template)
    .bind(&prompt.user_template)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_profile(pool: &SqlitePool, profile_id: &str) -> Result<Option<Profile>> {
    let row: Option<(String, String, String, String, String, String, i64)> = sqlx::query_as(
        "SELECT id, name, provider_id, model_id, prompt_id, params_json, enabled
         FROM llm_profiles WHERE id = ?",
    )
    .bind(profile_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(
        |(id, name, provider_id, model_id, prompt_id, params_json, enabled)| Profile {
            id,
            name,
            provider_id,
            model_id,
            prompt_id,
            params: serde_json::from_str(&params_json).unwrap_or_default(),
            enabled: enabled != 0,
        },
    ))
}

pub async fn upsert_profile(pool: &SqlitePool, profile: &Profile) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO llm_profiles (id, name, provider_id, model_id, prompt_id, params_json, enabled)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            provider_id = excluded.provider_id,
            model_id = excluded.model_id,
            prompt_id = excluded.prompt_id,
            params_json = excluded.params_json,
            enabled = excluded.enabled
        "#,
    )
    .bind(&profile.id)
    .bind(&profile.name)
    .bind(&profile.provider_id)
    .bind(&profile.model_id)
    .bind(&profile.prompt_id)
    .bind(serde_json::to_string(&profile.params).unwrap_or_else(|_| "{}".into()))
    .bind(profile.enabled as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// The enabled profile routed to a stage, if any.
pub async fn get_profile_for_stage(pool: &SqlitePool, stage: &str) -> Result<Option<Profile>> {
    let route: Option<(String,)> =
        sqlx::query_as("SELECT profile_id FROM llm_stage_routes WHERE stage = ?")
            .bind(stage)
            .fetch_optional(pool)
            .await?;
    let Some((profile_id,)) = route else {
        return Ok(None);
    };
    let profile = get_profile(pool, &profile_id).await?;
    Ok(profile.filter(|p| p.enabled))
}

pub async fn set_stage_route(pool: &SqlitePool, stage: &str, profile_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO llm_stage_routes (stage, profile_id)
        VALUES (?, ?)
        ON CONFLICT(stage) DO UPDATE SET profile_id = excluded.profile_id
        "#,
    )
    .bind(stage)
    .bind(profile_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_llm_run(pool: &SqlitePool, run: &LlmRun) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO llm_runs (ts, profile_id, provider_id, model_id, prompt_name, input_chars,
                              output_chars, prompt_tokens, completion_tokens, latency_ms, ok, error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&run.ts)
    .bind(&run.profile_id)
    .bind(&run.provider_id)
    .bind(&run.model_id)
    .bind(&run.prompt_name)
    .bind(run.input_chars)
    .bind(run.output_chars)
    .bind(run.prompt_tokens)
    .bind(run.completion_tokens)
    .bind(run.latency_ms)
    .bind(run.ok as i64)
    .bind(&run.error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_llm_runs(pool: &SqlitePool) -> Result<(i64, i64)> {
    let ok: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_runs WHERE ok = 1")
        .fetch_one(pool)
        .await?;
    let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_runs WHERE ok = 0")
        .fetch_one(pool)
        .await?;
    Ok((ok, failed))
}
