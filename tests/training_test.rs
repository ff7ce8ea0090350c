//! Training pipeline integration tests: real profiles on disk, real
//! artifacts, checked for determinism and the documented failure modes.

use hark::config::Profile;
use hark::fst::WeightedFst;
use hark::train::Trainer;
use std::path::{Path, PathBuf};

const SENTENCES: &str = "\
[ChangeLightState]
turn (on | off){state} the (kitchen | bedroom){name} light

[GetTime]
what time is it
";

const BASE_DICT: &str = "\
turn T ER N
on AA N
off AO F
the DH AH
kitchen K IH CH AH N
bedroom B EH D R UW M
light L AY T
what W AH T
time T AY M
is IH Z
it IH T
hey HH EY
hark HH AA R K
";

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn make_profile(root: &Path, extra_toml: &str) -> Profile {
    let profile_dir = root.join("en");
    write(&profile_dir.join("sentences.ini"), SENTENCES);
    write(&profile_dir.join("base_dictionary.txt"), BASE_DICT);
    write(
        &profile_dir.join("profile.toml"),
        &format!("[wake]\nkeyphrase = \"hey hark\"\n{extra_toml}"),
    );
    Profile::load("en", vec![root.to_path_buf()]).unwrap()
}

fn artifact(profile: &Profile, name: &str) -> PathBuf {
    profile.read_path(name)
}

#[test]
fn training_produces_all_artifacts() {
    let root = tempfile::tempdir().unwrap();
    let profile = make_profile(root.path(), "");

    let report = Trainer::new(profile.clone()).run(|_| {}).unwrap();
    assert!(report.ran.len() >= 4, "expected tasks to run: {report:?}");

    for name in [
        "grammars/ChangeLightState.gram",
        "grammars/GetTime.gram",
        "intent.fst",
        "vocab.txt",
        "dictionary.txt",
        "language_model.txt",
    ] {
        assert!(
            artifact(&profile, name).is_file(),
            "missing artifact: {name}"
        );
    }

    let arpa = std::fs::read_to_string(artifact(&profile, "language_model.txt")).unwrap();
    assert!(arpa.starts_with("\\data\\"));
    assert!(arpa.contains("\\1-grams:"));
    assert!(arpa.trim_end().ends_with("\\end\\"));
}

#[test]
fn dictionary_covers_the_intent_fst_vocabulary() {
    let root = tempfile::tempdir().unwrap();
    let profile = make_profile(root.path(), "");
    Trainer::new(profile.clone()).run(|_| {}).unwrap();

    let fst = WeightedFst::load(&artifact(&profile, "intent.fst")).unwrap();
    let dictionary =
        std::fs::read_to_string(artifact(&profile, "dictionary.txt")).unwrap();
    let dict_words: Vec<&str> = dictionary
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .collect();

    for word in fst.input_vocabulary() {
        assert!(
            dict_words.contains(&word.as_str()),
            "dictionary is missing '{word}'"
        );
    }
}

#[test]
fn retraining_without_changes_is_a_near_noop_and_deterministic() {
    let root = tempfile::tempdir().unwrap();
    let profile = make_profile(root.path(), "");

    Trainer::new(profile.clone()).run(|_| {}).unwrap();
    let first_fst = std::fs::read(artifact(&profile, "intent.fst")).unwrap();
    let first_dict = std::fs::read(artifact(&profile, "dictionary.txt")).unwrap();
    let first_lm = std::fs::read(artifact(&profile, "language_model.txt")).unwrap();

    // Second run: everything is fresh.
    let report = Trainer::new(profile.clone()).run(|_| {}).unwrap();
    assert!(
        report.ran.is_empty(),
        "expected a no-op rerun, but ran {:?}",
        report.ran
    );

    // Force a rebuild; artifacts must come out byte-identical.
    let sentences = artifact(&profile, "sentences.ini");
    let text = std::fs::read_to_string(&sentences).unwrap();
    std::fs::write(&sentences, text).unwrap();
    filetime_touch(&sentences);
    Trainer::new(profile.clone()).run(|_| {}).unwrap();

    assert_eq!(first_fst, std::fs::read(artifact(&profile, "intent.fst")).unwrap());
    assert_eq!(
        first_dict,
        std::fs::read(artifact(&profile, "dictionary.txt")).unwrap()
    );
    assert_eq!(
        first_lm,
        std::fs::read(artifact(&profile, "language_model.txt")).unwrap()
    );
}

/// Bump a file's mtime past the artifacts written in the same test.
fn filetime_touch(path: &Path) {
    let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(later).unwrap();
}

#[test]
fn unknown_word_fails_training_when_configured() {
    let root = tempfile::tempdir().unwrap();
    let profile_dir = root.path().join("en");
    write(
        &profile_dir.join("sentences.ini"),
        "[Travel]\ntake me to raxacoricofallapatorius\n",
    );
    write(&profile_dir.join("base_dictionary.txt"), "take T EY K\nme M IY\nto T UW\n");
    write(
        &profile_dir.join("profile.toml"),
        "[training]\nfail_on_unknown = true\n[training.g2p]\nenabled = false\n",
    );
    let profile = Profile::load("en", vec![root.path().to_path_buf()]).unwrap();

    let err = Trainer::new(profile.clone()).run(|_| {}).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("unknown words"));
    assert!(message.contains("raxacoricofallapatorius"));
    // Exactly the one word.
    assert!(!message.contains(","));

    let unknown =
        std::fs::read_to_string(profile.read_path("unknown_words.txt")).unwrap();
    assert_eq!(unknown.trim(), "raxacoricofallapatorius");
}

#[cfg(unix)]
#[test]
fn g2p_rescues_unknown_words() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempfile::tempdir().unwrap();
    let profile_dir = root.path().join("en");
    write(
        &profile_dir.join("sentences.ini"),
        "[Travel]\ntake me to raxacoricofallapatorius\n",
    );
    write(&profile_dir.join("base_dictionary.txt"), "take T EY K\nme M IY\nto T UW\n");
    write(&profile_dir.join("g2p.fst"), "fake model\n");

    // A stand-in G2P tool: guesses one pronunciation per listed word.
    let tool = root.path().join("fake-g2p");
    std::fs::write(
        &tool,
        "#!/bin/sh\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"--word_list\" ]; then list=\"$2\"; fi\n  shift\ndone\nwhile read -r word; do\n  echo \"$word F OW N IY M\"\ndone < \"$list\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    write(
        &profile_dir.join("profile.toml"),
        &format!(
            "[training]\nfail_on_unknown = false\n[training.g2p]\nenabled = true\nprogram = \"{}\"\n",
            tool.display()
        ),
    );
    let profile = Profile::load("en", vec![root.path().to_path_buf()]).unwrap();

    Trainer::new(profile.clone()).run(|_| {}).unwrap();

    let dictionary =
        std::fs::read_to_string(profile.read_path("dictionary.txt")).unwrap();
    assert!(dictionary.contains("raxacoricofallapatorius F OW N IY M"));

    // The guess is persisted to the custom-words file for review.
    let custom = std::fs::read_to_string(profile.read_path("custom_words.txt")).unwrap();
    assert!(custom.contains("raxacoricofallapatorius F OW N IY M"));
}

#[test]
fn mixing_weight_zero_never_reads_the_base_model() {
    let root = tempfile::tempdir().unwrap();
    // No base_language_model.txt exists; training must not need it.
    let profile = make_profile(root.path(), "[training]\nmix_weight = 0.0\n");
    Trainer::new(profile.clone()).run(|_| {}).unwrap();
    assert!(profile.read_path("language_model.txt").is_file());
    assert!(!root.path().join("en/base_language_model.txt.fst").exists());
}

#[test]
fn fuzzy_strategy_writes_examples() {
    let root = tempfile::tempdir().unwrap();
    let profile = make_profile(root.path(), "[intent]\nsystem = \"fuzzy\"\n");
    Trainer::new(profile.clone()).run(|_| {}).unwrap();

    let examples =
        std::fs::read_to_string(profile.read_path("intent_examples.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&examples).unwrap();
    assert!(parsed.get("ChangeLightState").is_some());
    assert!(parsed.get("GetTime").is_some());
}

#[test]
fn keyword_strategy_writes_required_and_optional_tokens() {
    let root = tempfile::tempdir().unwrap();
    let profile = make_profile(root.path(), "[intent]\nsystem = \"keyword\"\n");
    Trainer::new(profile.clone()).run(|_| {}).unwrap();

    let config =
        std::fs::read_to_string(profile.read_path("keyword_intents.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
    let required = parsed["entities"]["ChangeLightStateRequiredKeyword"]
        .as_array()
        .unwrap();
    assert!(required.iter().any(|w| w == "turn"));
    assert!(required.iter().any(|w| w == "light"));
}
