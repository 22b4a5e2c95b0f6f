//! End-to-end round trips through the public API: self-contained groups,
//! global trees, reference channels, transforms, and randomized images.

use maans_bitstream::{BitWriter, Bitstream};
use maans_coding::{build_and_encode_histograms, write_tokens};
use maans_modular::{
    modular_generic_compress, modular_generic_decompress, tokenize_tree, Channel, CompressOutput,
    ErrorKind, GroupHeader, Image, MaConfig, ModularOptions, Predictor, PredictorChoice,
    Transform, Tree, TreeNode, NUM_TREE_CONTEXTS,
};

fn encode_inline(image: &Image, options: &ModularOptions, group_id: u32) -> Vec<u8> {
    let mut writer = BitWriter::new();
    modular_generic_compress(
        image,
        options,
        group_id,
        CompressOutput::Inline {
            writer: &mut writer,
        },
    )
    .unwrap();
    writer.finalize()
}

fn blank_like(image: &Image) -> Image {
    let mut blank = image.clone();
    for channel in &mut blank.channel {
        for v in channel.data_mut() {
            *v = 0;
        }
    }
    blank.transform.clear();
    blank
}

fn roundtrip(image: &Image, options: &ModularOptions, group_id: u32) -> Image {
    let bytes = encode_inline(image, options, group_id);
    let mut decoded = blank_like(image);
    let mut bitstream = Bitstream::new(&bytes);
    modular_generic_decompress(&mut bitstream, &mut decoded, group_id, options, -1, None).unwrap();
    decoded
}

fn single_channel_image(w: usize, h: usize, data: Vec<i32>) -> Image {
    let mut image = Image::new(w, h);
    image.channel.push(Channel::from_data(w, h, data));
    image
}

#[test]
fn s1_constant_channel() {
    let image = single_channel_image(4, 4, vec![7; 16]);
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Zero),
        ..ModularOptions::default()
    };
    let decoded = roundtrip(&image, &options, 0);
    assert_eq!(decoded.channel, image.channel);
}

#[test]
fn s2_ramp_with_left_predictor() {
    let image = single_channel_image(8, 1, (0..8).collect());
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Left),
        nb_repeats: 0.0,
        ..ModularOptions::default()
    };
    let decoded = roundtrip(&image, &options, 0);
    assert_eq!(decoded.channel, image.channel);
}

#[test]
fn s3_gradient_two_by_two() {
    let image = single_channel_image(2, 2, vec![10, 20, 30, 45]);
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Gradient),
        nb_repeats: 0.0,
        ..ModularOptions::default()
    };
    let decoded = roundtrip(&image, &options, 0);
    assert_eq!(decoded.channel, image.channel);
}

#[test]
fn s4_force_wp_only() {
    let data: Vec<i32> = (0..64).map(|i| (i * 57) % 47 - 23).collect();
    let image = single_channel_image(8, 8, data);
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Weighted),
        force_wp_only: true,
        nb_repeats: 1.0,
        splitting_heuristics_node_threshold: 1.0,
        ..ModularOptions::default()
    };
    let decoded = roundtrip(&image, &options, 0);
    assert_eq!(decoded.channel, image.channel);
}

#[test]
fn s5_reference_channels_through_global_tree() {
    // channel 1 follows channel 0 closely, so a tree keyed on a reference
    // property separates its residual populations
    let base: Vec<i32> = (0..64).map(|i| (i * 13) % 90 - 45).collect();
    let follow: Vec<i32> = base.iter().map(|&v| v + (v % 3)).collect();
    let mut image = Image::new(8, 8);
    image.channel.push(Channel::from_data(8, 8, base));
    image.channel.push(Channel::from_data(8, 8, follow));

    // decoder-view tree: split on the first reference property (|c| of the
    // closest matching prior channel)
    let tree: Tree = vec![
        TreeNode::decision(16, 20, 1, 2),
        TreeNode::leaf(0, Predictor::Gradient, 0, 1),
        TreeNode::leaf(1, Predictor::Left, 0, 1),
    ];
    let options = ModularOptions::default();
    let group_id = 3;

    let mut header = GroupHeader::default();
    let mut tokens = Vec::new();
    let mut width = 0usize;
    modular_generic_compress(
        &image,
        &options,
        group_id,
        CompressOutput::Tokens {
            tree: &tree,
            header: &mut header,
            tokens: &mut tokens,
            width: &mut width,
        },
    )
    .unwrap();
    assert!(header.use_global_tree);
    assert_eq!(width, 8);
    assert_eq!(tokens.len(), 128);

    // global section: tree, then the sample distributions
    let mut writer = BitWriter::new();
    let (tree_tokens, bfs_tree) = tokenize_tree(&tree);
    assert_eq!(bfs_tree, tree);
    let tree_code = build_and_encode_histograms(NUM_TREE_CONTEXTS, &tree_tokens, &mut writer);
    write_tokens(&tree_tokens, &tree_code, &mut writer);
    let code = build_and_encode_histograms((tree.len() + 1) / 2, &tokens, &mut writer);
    // group section: header, then the token stream
    header.write(&mut writer).unwrap();
    write_tokens(&tokens, &code, &mut writer);
    let bytes = writer.finalize();

    let mut bitstream = Bitstream::new(&bytes);
    let config = MaConfig::parse(&mut bitstream, 1 << 20).unwrap();
    let mut decoded = blank_like(&image);
    modular_generic_decompress(
        &mut bitstream,
        &mut decoded,
        group_id,
        &options,
        -1,
        Some(&config),
    )
    .unwrap();
    assert_eq!(decoded.channel, image.channel);
}

#[test]
fn global_tree_missing_is_reported() {
    let image = single_channel_image(4, 4, vec![1; 16]);
    let options = ModularOptions::default();

    let tree: Tree = vec![TreeNode::leaf(0, Predictor::Zero, 0, 1)];
    let mut header = GroupHeader::default();
    let mut tokens = Vec::new();
    let mut width = 0usize;
    modular_generic_compress(
        &image,
        &options,
        0,
        CompressOutput::Tokens {
            tree: &tree,
            header: &mut header,
            tokens: &mut tokens,
            width: &mut width,
        },
    )
    .unwrap();

    let mut writer = BitWriter::new();
    header.write(&mut writer).unwrap();
    let code = build_and_encode_histograms(1, &tokens, &mut writer);
    write_tokens(&tokens, &code, &mut writer);
    let bytes = writer.finalize();

    let mut decoded = blank_like(&image);
    let mut bitstream = Bitstream::new(&bytes);
    let err = modular_generic_decompress(&mut bitstream, &mut decoded, 0, &options, -1, None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedStream);
}

#[test]
fn s6_corrupt_stream_is_rejected() {
    let image = single_channel_image(8, 8, (0..64).map(|i| i % 5).collect());
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Left),
        ..ModularOptions::default()
    };
    let bytes = encode_inline(&image, &options, 0);

    // truncate the tail of the token stream
    let truncated = &bytes[..bytes.len() - 2];
    let mut decoded = blank_like(&image);
    let mut bitstream = Bitstream::new(truncated);
    let err = modular_generic_decompress(&mut bitstream, &mut decoded, 0, &options, -1, None)
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::MalformedStream | ErrorKind::Io
    ));
}

#[test]
fn saturation_extreme_samples() {
    let image = single_channel_image(
        4,
        2,
        vec![i32::MAX, i32::MIN, 0, -1, i32::MAX, 1, i32::MIN, 2],
    );
    let options = ModularOptions {
        predictor: PredictorChoice::Fixed(Predictor::Zero),
        ..ModularOptions::default()
    };
    let decoded = roundtrip(&image, &options, 0);
    assert_eq!(decoded.channel, image.channel);
}

#[test]
fn channel_selection_parity() {
    let mut image = Image::new(8, 8);
    image.channel.push(Channel::from_data(4, 4, vec![3; 16])); // meta
    image.channel.push(Channel::new(0, 8)); // empty
    image
        .channel
        .push(Channel::from_data(8, 8, (0..64).collect()));
    image
        .channel
        .push(Channel::from_data(40, 40, vec![9; 1600])); // oversized
    image.channel.push(Channel::from_data(8, 8, vec![5; 64])); // after cutoff
    image.nb_meta_channels = 1;

    let options = ModularOptions {
        max_chan_size: 32,
        ..ModularOptions::default()
    };
    let decoded = roundtrip(&image, &options, 0);

    assert_eq!(decoded.channel[0], image.channel[0]);
    assert_eq!(decoded.channel[2], image.channel[2]);
    // beyond the cutoff nothing was coded
    assert!(decoded.channel[3].data().iter().all(|&v| v == 0));
    assert!(decoded.channel[4].data().iter().all(|&v| v == 0));
}

#[test]
fn rct_is_undone_after_decode() {
    let rgb: Vec<(i32, i32, i32)> = (0..16)
        .map(|i| (i * 11 % 256, i * 7 % 200, i * 29 % 256))
        .collect();
    // lossless YCoCg-R forward transform, as the enclosing pipeline would
    // have applied it
    let mut y_c = Vec::new();
    let mut co_c = Vec::new();
    let mut cg_c = Vec::new();
    for &(r, g, b) in &rgb {
        let co = r - b;
        let tmp = b + (co >> 1);
        let cg = g - tmp;
        y_c.push(tmp + (cg >> 1));
        co_c.push(co);
        cg_c.push(cg);
    }

    let mut image = Image::new(4, 4);
    image.channel.push(Channel::from_data(4, 4, y_c));
    image.channel.push(Channel::from_data(4, 4, co_c));
    image.channel.push(Channel::from_data(4, 4, cg_c));
    image.transform.push(Transform::Rct {
        begin_c: 0,
        rct_type: 6,
    });

    let options = ModularOptions::default();
    let bytes = encode_inline(&image, &options, 0);

    let mut decoded = blank_like(&image);
    let mut bitstream = Bitstream::new(&bytes);
    modular_generic_decompress(&mut bitstream, &mut decoded, 0, &options, -1, None).unwrap();

    for (i, &(r, g, b)) in rgb.iter().enumerate() {
        assert_eq!(decoded.channel[0].data()[i], r);
        assert_eq!(decoded.channel[1].data()[i], g);
        assert_eq!(decoded.channel[2].data()[i], b);
    }
    assert!(decoded.transform.is_empty());
}

#[test]
fn identify_stops_after_header() {
    let image = single_channel_image(8, 8, (0..64).collect());
    let options = ModularOptions::default();
    let bytes = encode_inline(&image, &options, 0);

    let mut decoded = blank_like(&image);
    let identify = ModularOptions {
        identify: true,
        ..options
    };
    let mut bitstream = Bitstream::new(&bytes);
    modular_generic_decompress(&mut bitstream, &mut decoded, 0, &identify, -1, None).unwrap();
    assert!(decoded.channel[0].data().iter().all(|&v| v == 0));
}

#[test]
fn every_fixed_predictor_roundtrips() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xbeef);
    let data: Vec<i32> = (0..15 * 11).map(|_| rng.gen_range(-300..300)).collect();
    let image = single_channel_image(15, 11, data);

    for predictor in [
        Predictor::Zero,
        Predictor::Left,
        Predictor::Top,
        Predictor::Average,
        Predictor::Select,
        Predictor::Gradient,
        Predictor::Weighted,
        Predictor::NorthEast,
        Predictor::NorthWest,
        Predictor::WestWest,
        Predictor::Average2,
        Predictor::Average3,
        Predictor::Average4,
        Predictor::AverageAll,
    ] {
        let options = ModularOptions {
            predictor: PredictorChoice::Fixed(predictor),
            nb_repeats: 0.0,
            ..ModularOptions::default()
        };
        let decoded = roundtrip(&image, &options, 0);
        assert_eq!(decoded.channel, image.channel, "predictor {:?}", predictor);
    }
}

#[test]
fn random_images_roundtrip_with_learning() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);

    for (choice, group_id) in [
        (PredictorChoice::Variable, 0u32),
        (PredictorChoice::Best, 7),
        (PredictorChoice::Fixed(Predictor::Weighted), 31),
    ] {
        for &(w, h, channels) in &[(13usize, 9usize, 1usize), (16, 16, 3), (5, 1, 2)] {
            let mut image = Image::new(w, h);
            for _ in 0..channels {
                let data: Vec<i32> = (0..w * h)
                    .map(|i| {
                        let smooth = (i % w) as i32 * 3 + (i / w) as i32 * 5;
                        smooth + rng.gen_range(-4..4)
                    })
                    .collect();
                image.channel.push(Channel::from_data(w, h, data));
            }
            let options = ModularOptions {
                predictor: choice,
                max_properties: 2,
                splitting_heuristics_node_threshold: 4.0,
                ..ModularOptions::default()
            };
            let decoded = roundtrip(&image, &options, group_id);
            assert_eq!(
                decoded.channel, image.channel,
                "choice {:?}, {}x{}x{}",
                choice, w, h, channels
            );
        }
    }
}

#[test]
fn force_no_wp_roundtrips_without_weighted_leaves() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(5);
    let data: Vec<i32> = (0..100).map(|_| rng.gen_range(-50..50)).collect();
    let image = single_channel_image(10, 10, data);
    let options = ModularOptions {
        predictor: PredictorChoice::Variable,
        force_no_wp: true,
        splitting_heuristics_node_threshold: 4.0,
        ..ModularOptions::default()
    };
    let decoded = roundtrip(&image, &options, 0);
    assert_eq!(decoded.channel, image.channel);
}

#[test]
fn groups_share_a_global_tree() {
    // two groups coded against one tree; static group-id decisions pick
    // different predictors per group
    let tree: Tree = vec![
        TreeNode::decision(1, 0, 1, 2),
        TreeNode::leaf(0, Predictor::Gradient, 0, 1),
        TreeNode::leaf(1, Predictor::Left, 0, 1),
    ];
    let images: Vec<Image> = (0..2)
        .map(|g| single_channel_image(6, 6, (0..36).map(|i| i * (g + 2)).collect()))
        .collect();
    let options = ModularOptions::default();

    let mut headers = Vec::new();
    let mut group_tokens = Vec::new();
    let mut all_tokens = Vec::new();
    for (g, image) in images.iter().enumerate() {
        let mut header = GroupHeader::default();
        let mut tokens = Vec::new();
        let mut width = 0usize;
        modular_generic_compress(
            image,
            &options,
            g as u32,
            CompressOutput::Tokens {
                tree: &tree,
                header: &mut header,
                tokens: &mut tokens,
                width: &mut width,
            },
        )
        .unwrap();
        headers.push(header);
        all_tokens.extend_from_slice(&tokens);
        group_tokens.push(tokens);
    }

    let mut writer = BitWriter::new();
    let (tree_tokens, _) = tokenize_tree(&tree);
    let tree_code = build_and_encode_histograms(NUM_TREE_CONTEXTS, &tree_tokens, &mut writer);
    write_tokens(&tree_tokens, &tree_code, &mut writer);
    let code = build_and_encode_histograms((tree.len() + 1) / 2, &all_tokens, &mut writer);
    for (header, tokens) in headers.iter().zip(&group_tokens) {
        header.write(&mut writer).unwrap();
        write_tokens(tokens, &code, &mut writer);
    }
    let bytes = writer.finalize();

    let mut bitstream = Bitstream::new(&bytes);
    let config = MaConfig::parse(&mut bitstream, 1 << 20).unwrap();
    for (g, image) in images.iter().enumerate() {
        let mut decoded = blank_like(image);
        modular_generic_decompress(
            &mut bitstream,
            &mut decoded,
            g as u32,
            &options,
            -1,
            Some(&config),
        )
        .unwrap();
        assert_eq!(decoded.channel, image.channel, "group {}", g);
    }
}
