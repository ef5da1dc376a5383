//! End-to-end scenarios over the in-memory daemon and registry fakes:
//! reproducibility across backends, rebase, layer reuse, multi-tag save
//! errors, and idempotent deletes.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Result;
use imgkit::daemon::DaemonClient;
use imgkit::{
    Backend, DaemonBackend, FakeDaemonClient, FakeRegistryClient, Image, ImageError, ImageOptions,
    ImageReference, RegistryBackend, StaticKeychain, normalized_date_time,
};

fn layer_tar(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut builder = tar::Builder::new(file);
    for (file_name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, file_name, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap();
    path
}

fn daemon_backend(client: &FakeDaemonClient) -> DaemonBackend<FakeDaemonClient> {
    DaemonBackend::new(client.clone()).unwrap()
}

fn registry_backend(
    client: &FakeRegistryClient,
) -> RegistryBackend<FakeRegistryClient, StaticKeychain> {
    RegistryBackend::new(client.clone(), StaticKeychain::new()).unwrap()
}

fn from_base(base: &str) -> ImageOptions {
    ImageOptions {
        base_image: Some(base.to_string()),
        ..ImageOptions::default()
    }
}

fn with_previous(previous: &str) -> ImageOptions {
    ImageOptions {
        previous_image: Some(previous.to_string()),
        ..ImageOptions::default()
    }
}

/// Apply the canonical reproducibility mutation sequence.
fn mutate<B: Backend>(image: &mut Image<B>, layer1: &Path, layer2: &Path) -> Result<()> {
    image.add_layer(layer1)?;
    image.add_layer(layer2)?;
    image.set_label("label-key", "label-val");
    image.set_env("env-key", "env-val");
    image.set_entrypoint(&["some", "entrypoint"]);
    image.set_cmd(&["some", "cmd"]);
    image.set_working_dir("/working-dir");
    image.save(&[])?;
    Ok(())
}

/// Flatten an image's layers into a path -> contents map, later layers
/// winning.
fn image_files<B: Backend>(image: &Image<B>) -> Result<HashMap<String, String>> {
    let mut files = HashMap::new();
    for diff_id in image.layer_diff_ids() {
        let reader = image.get_layer(&diff_id)?;
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.display().to_string();
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            files.insert(name, contents);
        }
    }
    Ok(files)
}

/// Strip the fields a containerd-backed daemon reports inconsistently, then
/// serialize for byte comparison.
fn comparable_config(mut config: imgkit::ConfigFile) -> Vec<u8> {
    config.docker_version = None;
    config.config.image = None;
    serde_json::to_vec(&config).unwrap()
}

#[test]
fn s1_reproducibility_daemon_to_daemon() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeDaemonClient::new();

    let base_layer = layer_tar(dir.path(), "base.tar", &[("base.txt", "base-content")]);
    let mut base = Image::new("runnable-base", daemon_backend(&client), ImageOptions::default())?;
    base.add_layer(&base_layer)?;
    base.save(&[])?;

    let layer1 = layer_tar(dir.path(), "layer1.tar", &[("new-layer-1.txt", "one")]);
    let layer2 = layer_tar(dir.path(), "layer2.tar", &[("new-layer-2.txt", "two")]);

    let mut image1 = Image::new("repro-image-1", daemon_backend(&client), from_base("runnable-base"))?;
    mutate(&mut image1, &layer1, &layer2)?;

    let mut image2 = Image::new("repro-image-2", daemon_backend(&client), from_base("runnable-base"))?;
    mutate(&mut image2, &layer1, &layer2)?;

    assert_eq!(image1.identifier()?, image2.identifier()?);

    let config1 = client.image_inspect("repro-image-1")?.unwrap().config;
    let config2 = client.image_inspect("repro-image-2")?.unwrap().config;
    assert_eq!(comparable_config(config1), comparable_config(config2));
    Ok(())
}

#[test]
fn s2_reproducibility_registry_to_registry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeRegistryClient::new();

    let base_layer = layer_tar(dir.path(), "base.tar", &[("base.txt", "base-content")]);
    let mut base = Image::new(
        "registry.test/runnable-base",
        registry_backend(&client),
        ImageOptions::default(),
    )?;
    base.add_layer(&base_layer)?;
    base.save(&[])?;

    let layer1 = layer_tar(dir.path(), "layer1.tar", &[("new-layer-1.txt", "one")]);
    let layer2 = layer_tar(dir.path(), "layer2.tar", &[("new-layer-2.txt", "two")]);

    let mut image1 = Image::new(
        "registry.test/repro-image-1",
        registry_backend(&client),
        from_base("registry.test/runnable-base"),
    )?;
    mutate(&mut image1, &layer1, &layer2)?;

    let mut image2 = Image::new(
        "registry.test/repro-image-2",
        registry_backend(&client),
        from_base("registry.test/runnable-base"),
    )?;
    mutate(&mut image2, &layer1, &layer2)?;

    // Registry identifiers are manifest digests; bit-identical manifests
    // share one.
    assert_eq!(image1.identifier()?, image2.identifier()?);

    let backend = registry_backend(&client);
    let config1 = backend
        .resolve(&ImageReference::parse("registry.test/repro-image-1")?)?
        .unwrap()
        .config;
    let config2 = backend
        .resolve(&ImageReference::parse("registry.test/repro-image-2")?)?
        .unwrap()
        .config;
    assert_eq!(comparable_config(config1), comparable_config(config2));
    Ok(())
}

#[test]
fn s3_reproducibility_across_backends() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let daemon = FakeDaemonClient::new();
    let registry = FakeRegistryClient::new();

    let base_layer = layer_tar(dir.path(), "base.tar", &[("base.txt", "base-content")]);
    let layer1 = layer_tar(dir.path(), "layer1.tar", &[("new-layer-1.txt", "one")]);
    let layer2 = layer_tar(dir.path(), "layer2.tar", &[("new-layer-2.txt", "two")]);

    // The same base content, published to each backend.
    let mut daemon_base =
        Image::new("runnable-base", daemon_backend(&daemon), ImageOptions::default())?;
    daemon_base.add_layer(&base_layer)?;
    daemon_base.save(&[])?;

    let mut registry_base = Image::new(
        "registry.test/runnable-base",
        registry_backend(&registry),
        ImageOptions::default(),
    )?;
    registry_base.add_layer(&base_layer)?;
    registry_base.save(&[])?;

    let mut local = Image::new("cross-image-1", daemon_backend(&daemon), from_base("runnable-base"))?;
    mutate(&mut local, &layer1, &layer2)?;

    let mut remote = Image::new(
        "registry.test/cross-image-2",
        registry_backend(&registry),
        from_base("registry.test/runnable-base"),
    )?;
    mutate(&mut remote, &layer1, &layer2)?;

    let local_config = daemon.image_inspect("cross-image-1")?.unwrap().config;
    let remote_config = registry_backend(&registry)
        .resolve(&ImageReference::parse("registry.test/cross-image-2")?)?
        .unwrap()
        .config;

    assert_eq!(comparable_config(local_config), comparable_config(remote_config));
    Ok(())
}

#[test]
fn s4_rebase_preserves_application_layers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeDaemonClient::new();

    // New base: different content in the same paths.
    let mut new_base = Image::new("pack-newbase-test", daemon_backend(&client), ImageOptions::default())?;
    new_base.add_layer(&layer_tar(dir.path(), "nb1.tar", &[("base.txt", "new-base")]))?;
    new_base.add_layer(&layer_tar(dir.path(), "nb2.tar", &[("otherfile.txt", "text-new-base")]))?;
    new_base.save(&[])?;

    // Old base.
    let mut old_base = Image::new("pack-oldbase-test", daemon_backend(&client), ImageOptions::default())?;
    old_base.add_layer(&layer_tar(dir.path(), "ob1.tar", &[("base.txt", "old-base")]))?;
    old_base.add_layer(&layer_tar(dir.path(), "ob2.tar", &[("otherfile.txt", "text-old-base")]))?;
    old_base.save(&[])?;
    let old_top_layer = old_base.top_layer()?;

    // Original image: old base plus two application layers.
    let mut original = Image::new("rebase-image", daemon_backend(&client), from_base("pack-oldbase-test"))?;
    original.add_layer(&layer_tar(dir.path(), "app1.tar", &[("myimage.txt", "text-from-image")]))?;
    original.add_layer(&layer_tar(dir.path(), "app2.tar", &[("myimage2.txt", "text-from-image")]))?;
    original.save(&[])?;
    let original_layer_count = original.layer_diff_ids().len();

    assert_eq!(
        image_files(&original)?.get("base.txt").map(String::as_str),
        Some("old-base")
    );

    // Rebase and save.
    let mut image = Image::new("rebase-image", daemon_backend(&client), from_base("rebase-image"))?;
    let new_base_handle = Image::new(
        "pack-newbase-test",
        daemon_backend(&client),
        from_base("pack-newbase-test"),
    )?;
    image.rebase(&old_top_layer, &new_base_handle)?;
    image.save(&[])?;

    let reloaded = Image::new("rebase-image", daemon_backend(&client), from_base("rebase-image"))?;
    let files = image_files(&reloaded)?;
    assert_eq!(files.get("base.txt").map(String::as_str), Some("new-base"));
    assert_eq!(
        files.get("otherfile.txt").map(String::as_str),
        Some("text-new-base")
    );
    assert_eq!(
        files.get("myimage.txt").map(String::as_str),
        Some("text-from-image")
    );
    assert_eq!(
        files.get("myimage2.txt").map(String::as_str),
        Some("text-from-image")
    );

    assert_eq!(reloaded.layer_diff_ids().len(), original_layer_count);
    Ok(())
}

#[test]
fn s5_reuse_layer_preserves_content() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeDaemonClient::new();

    let mut previous = Image::new("prev-image", daemon_backend(&client), ImageOptions::default())?;
    previous.add_layer(&layer_tar(dir.path(), "l1.tar", &[("layer-1.txt", "old-layer-1")]))?;
    previous.add_layer(&layer_tar(dir.path(), "l2.tar", &[("layer-2.txt", "old-layer-2")]))?;
    previous.save(&[])?;
    let diff_ids = previous.layer_diff_ids();
    let layer2_diff_id = diff_ids.last().unwrap().clone();

    let mut image = Image::new("reuse-image", daemon_backend(&client), with_previous("prev-image"))?;
    image.add_layer(&layer_tar(dir.path(), "nb.tar", &[("new-base.txt", "base-content")]))?;
    image.reuse_layer(&layer2_diff_id)?;
    image.save(&[])?;

    let reloaded = Image::new("reuse-image", daemon_backend(&client), from_base("reuse-image"))?;
    let files = image_files(&reloaded)?;
    assert_eq!(
        files.get("layer-2.txt").map(String::as_str),
        Some("old-layer-2")
    );
    assert!(!files.contains_key("layer-1.txt"));
    Ok(())
}

#[test]
fn add_layer_with_diff_id_skips_rehash() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeDaemonClient::new();

    let mut base = Image::new("prehash-base", daemon_backend(&client), ImageOptions::default())?;
    base.add_layer(&layer_tar(dir.path(), "old.tar", &[("old-layer.txt", "old-layer")]))?;
    base.save(&[])?;

    let new_layer = layer_tar(dir.path(), "new.tar", &[("new-layer.txt", "new-layer")]);
    let diff_id = imgkit::diff_id_of(&new_layer)?;

    let mut image = Image::new("prehash-image", daemon_backend(&client), from_base("prehash-base"))?;
    image.add_layer_with_diff_id(&new_layer, &diff_id);
    image.save(&[])?;

    let reloaded = Image::new("prehash-image", daemon_backend(&client), from_base("prehash-image"))?;
    let files = image_files(&reloaded)?;
    assert_eq!(files.get("old-layer.txt").map(String::as_str), Some("old-layer"));
    assert_eq!(files.get("new-layer.txt").map(String::as_str), Some("new-layer"));
    Ok(())
}

#[test]
fn reuse_layer_missing_from_previous_image() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeDaemonClient::new();

    let mut previous = Image::new("prev-image", daemon_backend(&client), ImageOptions::default())?;
    previous.add_layer(&layer_tar(dir.path(), "l1.tar", &[("layer-1.txt", "one")]))?;
    previous.save(&[])?;

    let mut image = Image::new("reuse-image", daemon_backend(&client), with_previous("prev-image"))?;
    let err = image.reuse_layer("sha256:absent").unwrap_err();
    assert_eq!(
        err.to_string(),
        "no previous image layer matching diff ID sha256:absent"
    );
    Ok(())
}

#[test]
fn save_accumulates_per_tag_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeDaemonClient::new();

    let mut image = Image::new("multi-tag-image", daemon_backend(&client), ImageOptions::default())?;
    image.add_layer(&layer_tar(dir.path(), "l.tar", &[("f.txt", "contents")]))?;

    let failing_name = "failing-image:🧨";
    let err = image
        .save(&["extra-tag-one", failing_name, "extra-tag-two"])
        .unwrap_err();

    assert!(err
        .to_string()
        .starts_with(&format!("failed to write image to the following tags: [{}:", failing_name)));

    let ImageError::Save(save_err) = err else {
        panic!("expected SaveError, got {err:?}");
    };
    assert_eq!(save_err.errors.len(), 1);
    assert_eq!(save_err.errors[0].image_name, failing_name);
    assert!(save_err.errors[0]
        .cause
        .to_string()
        .contains("invalid reference format"));

    for name in ["multi-tag-image", "extra-tag-one", "extra-tag-two"] {
        assert!(client.image_inspect(name)?.is_some(), "{name} should exist");
    }
    Ok(())
}

#[test]
fn save_surfaces_daemon_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeDaemonClient::new();

    let invalid_layer = dir.path().join("not-a-tar");
    std::fs::write(&invalid_layer, b"NOT A TAR")?;

    let mut image = Image::new("invalid-content", daemon_backend(&client), ImageOptions::default())?;
    image.add_layer(&invalid_layer)?;

    let err = image.save(&[]).unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("failed to write image to the following tags: [invalid-content:"));
    assert!(message.contains("daemon response"));
    Ok(())
}

#[test]
fn save_normalizes_times_and_daemon_fields() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeDaemonClient::new();

    let mut image = Image::new("normalized-image", daemon_backend(&client), ImageOptions::default())?;
    image.add_layer(&layer_tar(dir.path(), "l.tar", &[("f.txt", "contents")]))?;
    image.set_label("mykey", "newValue");
    image.save(&[])?;

    let config = client.image_inspect("normalized-image")?.unwrap().config;
    assert_eq!(config.created, Some(normalized_date_time()));
    assert_eq!(config.container, None);
    assert_eq!(config.docker_version, None);
    assert_eq!(config.config.image, None);

    let history = client.image_history("normalized-image")?;
    assert_eq!(history.len(), config.rootfs.diff_ids.len());
    for entry in history {
        assert_eq!(entry.created, normalized_date_time().timestamp());
    }
    Ok(())
}

#[test]
fn delete_is_idempotent_and_id_addressed() -> Result<()> {
    let client = FakeDaemonClient::new();

    // Deleting an image that never existed succeeds.
    let mut missing = Image::new("image-does-not-exist", daemon_backend(&client), ImageOptions::default())?;
    missing.delete()?;
    missing.delete()?;

    // A handle created before a re-tag still deletes through the image ID.
    let mut original = Image::new("delete-me", daemon_backend(&client), ImageOptions::default())?;
    original.set_label("some", "label");
    original.save(&[])?;

    let mut handle = Image::new("delete-me", daemon_backend(&client), from_base("delete-me"))?;
    let id = handle.identifier()?;
    client.image_tag(&id, "different-tag")?;
    client.image_remove("delete-me", false)?;

    assert!(handle.found());
    handle.delete()?;

    let after = Image::new("different-tag", daemon_backend(&client), ImageOptions::default())?;
    assert!(!after.found());
    Ok(())
}

#[test]
fn get_layer_error_surface() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeDaemonClient::new();

    let missing = Image::new("ghost-image", daemon_backend(&client), ImageOptions::default())?;
    let err = missing.get_layer("sha256:anything").err().unwrap();
    assert!(err.to_string().contains("No such image"));

    let mut saved = Image::new("layered-image", daemon_backend(&client), ImageOptions::default())?;
    saved.add_layer(&layer_tar(dir.path(), "l.tar", &[("file.txt", "file-contents")]))?;
    saved.save(&[])?;

    let handle = Image::new("layered-image", daemon_backend(&client), from_base("layered-image"))?;
    let err = handle.get_layer("not-exist").err().unwrap();
    assert_eq!(
        err.to_string(),
        "image 'layered-image' does not contain layer with diff ID 'not-exist'"
    );

    let top = handle.top_layer()?;
    let mut archive = tar::Archive::new(handle.get_layer(&top)?);
    let mut contents = String::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.display().to_string().ends_with("file.txt") {
            entry.read_to_string(&mut contents)?;
        }
    }
    assert_eq!(contents, "file-contents");
    Ok(())
}

#[test]
fn registry_mounts_blobs_cross_repo() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeRegistryClient::new();

    let mut base = Image::new(
        "registry.test/base-repo",
        registry_backend(&client),
        ImageOptions::default(),
    )?;
    base.add_layer(&layer_tar(dir.path(), "base.tar", &[("base.txt", "base")]))?;
    base.save(&[])?;

    let mut app = Image::new(
        "registry.test/app-repo",
        registry_backend(&client),
        from_base("registry.test/base-repo"),
    )?;
    app.add_layer(&layer_tar(dir.path(), "app.tar", &[("app.txt", "app")]))?;
    app.save(&[])?;

    let mounts = client.mounts();
    assert!(
        mounts
            .iter()
            .any(|(to, from, _)| to == "app-repo" && from == "base-repo"),
        "base layer should be mounted cross-repo, got {mounts:?}"
    );
    Ok(())
}

#[test]
fn registry_reuse_fails_when_blob_garbage_collected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeRegistryClient::new();

    let mut previous = Image::new(
        "registry.test/prev-repo",
        registry_backend(&client),
        ImageOptions::default(),
    )?;
    previous.add_layer(&layer_tar(dir.path(), "l.tar", &[("layer.txt", "contents")]))?;
    previous.save(&[])?;

    let backend = registry_backend(&client);
    let resolved = backend
        .resolve(&ImageReference::parse("registry.test/prev-repo")?)?
        .unwrap();
    let layer = &resolved.layers[0];

    client.remove_blob(
        "registry.test",
        "prev-repo",
        layer.digest.as_deref().unwrap(),
    );

    let mut image = Image::new(
        "registry.test/next-repo",
        registry_backend(&client),
        with_previous("registry.test/prev-repo"),
    )?;
    image.reuse_layer(&layer.diff_id)?;

    let err = image.save(&[]).unwrap_err();
    assert!(err
        .to_string()
        .contains(&format!("no previous image layer matching diff ID {}", layer.diff_id)));
    Ok(())
}

#[test]
fn registry_get_layer_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = FakeRegistryClient::new();

    let layer = layer_tar(dir.path(), "l.tar", &[("data.txt", "remote-data")]);
    let mut image = Image::new(
        "registry.test/layered",
        registry_backend(&client),
        ImageOptions::default(),
    )?;
    image.add_layer(&layer)?;
    image.save(&[])?;

    let handle = Image::new(
        "registry.test/layered",
        registry_backend(&client),
        from_base("registry.test/layered"),
    )?;
    let diff_ids = handle.layer_diff_ids();
    let mut reader = handle.get_layer(&diff_ids[0])?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    assert_eq!(bytes, std::fs::read(&layer)?);

    let err = handle.get_layer("sha256:absent").err().unwrap();
    assert!(err.to_string().contains("does not contain layer with diff ID"));

    let ghost = Image::new(
        "registry.test/ghost",
        registry_backend(&client),
        ImageOptions::default(),
    )?;
    let err = ghost.get_layer("sha256:absent").err().unwrap();
    assert!(matches!(err, ImageError::ImageNotFound(_)));
    Ok(())
}

#[test]
fn windows_daemon_synthesizes_base_layer() -> Result<()> {
    let client = FakeDaemonClient::with_os("windows", Some("10.0.17763.1040"));

    let mut image = Image::new("windows-empty", daemon_backend(&client), ImageOptions::default())?;
    assert_eq!(image.os(), "windows");
    image.save(&[])?;

    let handle = Image::new("windows-empty", daemon_backend(&client), from_base("windows-empty"))?;
    let diff_ids = handle.layer_diff_ids();
    assert_eq!(diff_ids.len(), 1);

    let mut archive = tar::Archive::new(handle.get_layer(&diff_ids[0])?);
    let names: Vec<String> = archive
        .entries()?
        .map(|entry| entry.unwrap().path().unwrap().display().to_string())
        .collect();
    assert_eq!(names, vec!["Files", "Hives"]);
    Ok(())
}

#[test]
fn empty_daemon_image_gets_platform_defaults() -> Result<()> {
    let client = FakeDaemonClient::new();

    let mut image = Image::new("defaults-image", daemon_backend(&client), ImageOptions::default())?;
    image.save(&[])?;

    let config = client.image_inspect("defaults-image")?.unwrap().config;
    assert_eq!(config.os, "linux");
    assert_eq!(config.architecture, "amd64");
    assert_eq!(config.rootfs.fs_type, "layers");
    Ok(())
}

#[test]
fn base_image_properties_carry_over() -> Result<()> {
    let client = FakeDaemonClient::new();

    let mut base = Image::new("labeled-base", daemon_backend(&client), ImageOptions::default())?;
    base.set_env("MY_VAR", "my_val");
    base.set_label("some.label", "some.value");
    base.save(&[])?;

    let image = Image::new("child-image", daemon_backend(&client), from_base("labeled-base"))?;
    assert_eq!(image.label("some.label"), "some.value");
    assert_eq!(image.env("MY_VAR"), "my_val");
    assert_eq!(image.label("missing-label"), "");
    assert!(image.found());
    assert_eq!(image.created_at(), normalized_date_time());
    Ok(())
}
