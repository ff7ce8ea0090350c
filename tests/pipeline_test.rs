//! End-to-end pipeline tests: dummy microphone fed programmatically, a
//! shell stand-in for the speech decoder, the trained intent FST, and a
//! mock home-automation collaborator.

use hark::config::Profile;
use hark::dialogue::SessionState;
use hark::pipeline::messages::AudioFrame;
use hark::runtime::Assistant;
use hark::train::Trainer;
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SENTENCES: &str = "\
[ChangeLightState]
turn (on | off){state} the (kitchen | bedroom){name} light
";

const BASE_DICT: &str = "\
turn T ER N
on AA N
off AO F
the DH AH
kitchen K IH CH AH N
bedroom B EH D R UW M
light L AY T
";

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// A trained profile wired to dummy audio, a `sh` decoder that always
/// prints `transcript`, the FST recognizer and the given handler URL.
fn trained_profile(root: &Path, transcript: &str, handler_url: &str) -> Profile {
    let profile_dir = root.join("en");
    write(&profile_dir.join("sentences.ini"), SENTENCES);
    write(&profile_dir.join("base_dictionary.txt"), BASE_DICT);
    write(
        &profile_dir.join("profile.toml"),
        &format!(
            r#"
[audio]
system = "dummy"
frame_ms = 30

[wake]
system = "dummy"
keyphrase = "hey hark"

[command]
min_command_sec = 0.09
silence_trailing_sec = 0.06
max_command_sec = 2.0
throwaway_frames = 2
leading_speech_frames = 2

[decode]
system = "command"

[decode.command]
program = "sh"
args = ["-c", "cat > /dev/null; printf '{transcript}'"]

[intent]
system = "fst"

[handle]
system = "home_automation"

[handle.home_automation]
url = "{handler_url}"
access_token = "test-token"
"#
        ),
    );

    let profile = Profile::load("en", vec![root.to_path_buf()]).unwrap();
    Trainer::new(profile.clone()).run(|_| {}).unwrap();
    profile
}

fn speech_frame(len: usize) -> AudioFrame {
    AudioFrame {
        samples: (0..len)
            .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
            .collect(),
        sample_rate: 16_000,
    }
}

fn silence_frame(len: usize) -> AudioFrame {
    AudioFrame {
        samples: vec![0; len],
        sample_rate: 16_000,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn command_to_intent_to_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/events/hark_ChangeLightState"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let profile = trained_profile(root.path(), "turn on the kitchen light", &server.uri());
    let frame_len = profile.config.audio.frame_samples();

    let assistant = Assistant::start(profile).unwrap();
    let dialogue = assistant.dialogue().clone();
    let source = dialogue.audio_source().await.unwrap();

    let session = {
        let dialogue = dialogue.clone();
        tokio::spawn(async move { dialogue.listen_for_command(true, None).await })
    };

    // Wait for the listener to be recording before feeding audio.
    loop {
        let (state, _) = dialogue.state().await.unwrap();
        if state == SessionState::Awake {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Feed: leading silence, speech, then trailing silence to bracket.
    for _ in 0..4 {
        source.inject(silence_frame(frame_len)).await;
    }
    for _ in 0..12 {
        source.inject(speech_frame(frame_len)).await;
    }
    for _ in 0..12 {
        source.inject(silence_frame(frame_len)).await;
    }

    let intent = session.await.unwrap().unwrap();

    assert_eq!(intent.intent.name, "ChangeLightState");
    assert_eq!(intent.raw_text, "turn on the kitchen light");
    let mut entities: Vec<(String, String)> = intent
        .entities
        .iter()
        .map(|e| (e.entity.clone(), e.value.clone()))
        .collect();
    entities.sort();
    assert_eq!(
        entities,
        vec![
            ("name".to_owned(), "kitchen".to_owned()),
            ("state".to_owned(), "on".to_owned())
        ]
    );
    assert!(intent.error.is_none(), "dispatch should succeed: {intent:?}");

    // The session wound down.
    let (state, _) = dialogue.state().await.unwrap();
    assert_eq!(state, SessionState::Ready);

    assistant.shutdown().await;
}

/// A distinctive two-tone stand-in for the spoken keyphrase.
fn keyphrase_signal() -> Vec<i16> {
    (0..16_000)
        .map(|i| {
            let t = i as f32 / 16_000.0;
            let freq = if t < 0.5 { 440.0 } else { 880.0 };
            ((2.0 * std::f32::consts::PI * freq * t).sin() * 12_000.0) as i16
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn wake_to_command_to_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/events/hark_ChangeLightState"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let profile_dir = root.path().join("en");
    write(&profile_dir.join("sentences.ini"), SENTENCES);
    write(&profile_dir.join("base_dictionary.txt"), BASE_DICT);

    // Reference recording of the keyphrase for the spotter.
    let signal = keyphrase_signal();
    let reference = hark::audio::wav::pcm_to_wav(&signal, 16_000).unwrap();
    std::fs::create_dir_all(profile_dir.join("wake")).unwrap();
    std::fs::write(profile_dir.join("wake/ref0.wav"), reference).unwrap();

    write(
        &profile_dir.join("profile.toml"),
        &format!(
            r#"
[audio]
system = "dummy"
frame_ms = 30

[wake]
system = "spotter"
keyphrase = "hey hark"
threshold = 0.35
preload = true

[command]
min_command_sec = 0.09
silence_trailing_sec = 0.06
max_command_sec = 2.0
throwaway_frames = 2
leading_speech_frames = 2

[decode]
system = "command"

[decode.command]
program = "sh"
args = ["-c", "cat > /dev/null; printf 'turn on the kitchen light'"]

[intent]
system = "fst"

[handle]
system = "home_automation"

[handle.home_automation]
url = "{}"
"#,
            server.uri()
        ),
    );

    let profile = Profile::load("en", vec![root.path().to_path_buf()]).unwrap();
    Trainer::new(profile.clone()).run(|_| {}).unwrap();
    let frame_len = profile.config.audio.frame_samples();

    let assistant = Assistant::start(profile).unwrap();
    let dialogue = assistant.dialogue().clone();
    let source = dialogue.audio_source().await.unwrap();

    dialogue.listen_for_wake().await.unwrap();
    let (state, _) = dialogue.state().await.unwrap();
    assert_eq!(state, SessionState::Asleep);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Speak the keyphrase until the coordinator wakes.
    let mut awake = false;
    'outer: for _ in 0..3 {
        for chunk in signal.chunks(frame_len) {
            source
                .inject(AudioFrame {
                    samples: chunk.to_vec(),
                    sample_rate: 16_000,
                })
                .await;
            let (state, _) = dialogue.state().await.unwrap();
            if state == SessionState::Awake {
                awake = true;
                break 'outer;
            }
        }
    }
    assert!(awake, "keyphrase was not detected");

    // Now the command, bracketed by silence.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..4 {
        source.inject(silence_frame(frame_len)).await;
    }
    for _ in 0..12 {
        source.inject(speech_frame(frame_len)).await;
    }
    for _ in 0..12 {
        source.inject(silence_frame(frame_len)).await;
    }

    // The wake-initiated session dispatches and returns to ready.
    let mut settled = false;
    for _ in 0..200 {
        let (state, _) = dialogue.state().await.unwrap();
        if state == SessionState::Ready {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled, "session did not settle back to ready");

    assistant.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn command_timeout_yields_empty_intent_and_no_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let profile = trained_profile(root.path(), "turn on the kitchen light", &server.uri());
    let frame_len = profile.config.audio.frame_samples();

    let assistant = Assistant::start(profile).unwrap();
    let dialogue = assistant.dialogue().clone();
    let source = dialogue.audio_source().await.unwrap();

    // Continuous silence: the listener times out with an empty buffer.
    let feeder = tokio::spawn(async move {
        for _ in 0..80 {
            source.inject(silence_frame(frame_len)).await;
        }
    });

    let intent = dialogue
        .listen_for_command(true, Some(0.5))
        .await
        .unwrap();
    feeder.await.unwrap();

    assert!(intent.is_empty());
    assert!(intent.entities.is_empty());

    let (state, _) = dialogue.state().await.unwrap();
    assert_eq!(state, SessionState::Ready);

    assistant.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_band_requests_do_not_disturb_the_session() {
    let root = tempfile::tempdir().unwrap();
    let profile = trained_profile(root.path(), "ignored", "http://127.0.0.1:1");

    let assistant = Assistant::start(profile).unwrap();
    let dialogue = assistant.dialogue().clone();

    // Direct recognition against the trained FST, no audio involved.
    let intent = dialogue
        .recognize_text("turn off the bedroom light")
        .await
        .unwrap();
    assert_eq!(intent.intent.name, "ChangeLightState");

    let (state, _) = dialogue.state().await.unwrap();
    assert_eq!(state, SessionState::Ready);

    // Unparseable text comes back as the empty intent, not an error.
    let intent = dialogue.recognize_text("open the pod bay doors").await.unwrap();
    assert!(intent.is_empty());

    // Speaking a synthesized sentence forwards to the player without
    // touching the session.
    let spoken = hark::audio::wav::pcm_to_wav(&[0i16; 1600], 16_000).unwrap();
    dialogue.play_wav(spoken).await.unwrap();
    let (state, _) = dialogue.state().await.unwrap();
    assert_eq!(state, SessionState::Ready);

    assistant.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wake_requests_during_training_are_refused_not_dropped() {
    let root = tempfile::tempdir().unwrap();
    let profile = trained_profile(root.path(), "ignored", "http://127.0.0.1:1");

    // Invalidate an artifact so training has real work to do.
    let sentences = profile.read_path("sentences.ini");
    let later = std::time::SystemTime::now() + Duration::from_secs(5);
    std::fs::OpenOptions::new()
        .write(true)
        .open(&sentences)
        .unwrap()
        .set_modified(later)
        .unwrap();

    let assistant = Assistant::start(profile).unwrap();
    let dialogue = assistant.dialogue().clone();

    let trainer = {
        let dialogue = dialogue.clone();
        tokio::spawn(async move { dialogue.train(true).await })
    };

    // The wake request lands while training holds the session.
    let mut saw_refusal = false;
    for _ in 0..50 {
        match dialogue.listen_for_wake().await {
            Err(e) => {
                assert!(e.to_string().contains("training in progress"));
                saw_refusal = true;
                break;
            }
            Ok(()) => tokio::time::sleep(Duration::from_millis(1)).await,
        }
    }

    let report = trainer.await.unwrap().unwrap();
    assert!(!report.ran.is_empty());
    // Training may have finished before the refusal landed; either way the
    // request was answered, never silently dropped.
    let _ = saw_refusal;

    assistant.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retraining_reloads_the_recognizer() {
    let root = tempfile::tempdir().unwrap();
    let profile = trained_profile(root.path(), "ignored", "http://127.0.0.1:1");

    let assistant = Assistant::start(profile.clone()).unwrap();
    let dialogue = assistant.dialogue().clone();

    // Warm the recognizer on the original grammar.
    let intent = dialogue
        .recognize_text("turn on the kitchen light")
        .await
        .unwrap();
    assert_eq!(intent.intent.name, "ChangeLightState");
    let intent = dialogue.recognize_text("good morning").await.unwrap();
    assert!(intent.is_empty());

    // A new grammar with a new intent.
    let sentences = profile.read_path("sentences.ini");
    std::fs::write(
        &sentences,
        format!("{SENTENCES}\n[Greet]\ngood (morning | evening)\n"),
    )
    .unwrap();
    let later = std::time::SystemTime::now() + Duration::from_secs(5);
    std::fs::OpenOptions::new()
        .write(true)
        .open(&sentences)
        .unwrap()
        .set_modified(later)
        .unwrap();

    dialogue.train(true).await.unwrap();

    // The reloaded recognizer knows the new intent.
    let intent = dialogue.recognize_text("good morning").await.unwrap();
    assert_eq!(intent.intent.name, "Greet");

    assistant.shutdown().await;
}
